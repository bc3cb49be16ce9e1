//! UDP socket wrapper for mio-based I/O.
//!
//! A single socket is shared by the receive and send threads of a driver.
//! Readiness is awaited through [`ReadWaiter`], which registers the raw fd
//! so the socket itself can stay behind an `Arc`.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use mio::net::UdpSocket as MioUdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::Endpoint;

const READABLE: Token = Token(0);

/// A non-blocking UDP socket.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends a datagram to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Receives one datagram.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.send_to(buf, dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, ep)) => Ok(Some((n, ep))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose SO_SNDBUF/SO_RCVBUF
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_send_buffer_size(
            self.inner.as_fd(),
        )?)
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Blocks until a socket becomes readable or a timeout elapses.
///
/// mio notifications are edge-triggered: callers must drain the socket
/// until `WouldBlock` before waiting again.
pub struct ReadWaiter {
    poll: Poll,
    events: Events,
}

impl ReadWaiter {
    /// Registers `socket` for read readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll instance cannot be created or the fd
    /// cannot be registered.
    pub fn new(socket: &UdpSocket) -> io::Result<Self> {
        let poll = Poll::new()?;
        let fd = socket.as_fd().as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), READABLE, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Returns `true` if the socket became readable before `timeout`.
    ///
    /// # Errors
    ///
    /// Returns poll failures other than `Interrupted`.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(!self.events.is_empty()),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_bind_and_local_addr() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(
            addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        );
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn waiter_times_out_then_wakes_on_datagram() {
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut waiter = ReadWaiter::new(&receiver).unwrap();

        assert!(!waiter.wait(Duration::from_millis(10)).unwrap());

        sender
            .send_to(b"depth", receiver.local_addr().unwrap())
            .unwrap();
        assert!(waiter.wait(Duration::from_secs(1)).unwrap());

        let mut buf = [0u8; 64];
        let (n, from) = receiver.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"depth");
        assert_eq!(from, sender.local_addr().unwrap());
        assert!(receiver.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn socket_buffer_sizes_grow() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let recv_size = socket.recv_buffer_size().unwrap();
        socket.set_recv_buffer_size(1024 * 1024).unwrap();
        socket.set_send_buffer_size(512 * 1024).unwrap();
        assert!(socket.recv_buffer_size().unwrap() >= recv_size);
        assert!(socket.send_buffer_size().unwrap() > 0);
    }
}
