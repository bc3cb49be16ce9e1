//! Receive side: socket ownership, datagram validation, and handoff.
//!
//! [`PacketReceiver`] binds the socket and either runs a background thread
//! (`start`/`stop`) or is driven by hand through `receive_once`. Both modes
//! run the same [`ReceiveLoop`], which validates each datagram, stamps its
//! arrival time, and appends it to a [`PacketQueue`]. The processing thread
//! drains that queue by swapping buffers, so the lock is held only for the
//! push or the swap.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

use crate::net::socket::ReadWaiter;
use crate::net::{Endpoint, EndpointId, Protocol, UdpSocket};
use crate::time::now_ns;
use crate::trace::{debug, error, info, trace, warn};

use super::config::DriverConfig;
use super::events::{Event, EventSink};
use super::protocol::{HEADER_SIZE, MAX_PACKET_SIZE, WireHeader, parse_datagram};
use super::stats::DriverStats;

/// Datagrams drained per pass before the stop flag is rechecked.
const MAX_BATCH: usize = 1024;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("invalid bind address {0:?}")]
    Address(String),
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("receiver thread is running")]
    Running,
    #[error("failed to spawn receiver thread: {0}")]
    Spawn(io::Error),
}

/// One validated datagram.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub endpoint: EndpointId,
    pub source: Endpoint,
    pub header: WireHeader,
    pub payload: Bytes,
    pub received_ns: i64,
}

/// Bounded double buffer between the receive and processing threads.
///
/// Beyond capacity the oldest packet is dropped.
#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<ReceivedPacket>>,
    capacity: usize,
}

impl PacketQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Appends a packet, returning the one dropped to make room, if any.
    pub fn push(&self, packet: ReceivedPacket) -> Option<ReceivedPacket> {
        let mut queue = self.inner.lock();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(packet);
        dropped
    }

    /// Exchanges the pending packets with `drained`, which should be empty.
    pub fn swap(&self, drained: &mut VecDeque<ReceivedPacket>) {
        mem::swap(&mut *self.inner.lock(), drained);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tunables of the receive path.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverOptions {
    pub max_packet_size: usize,
    pub receive_timeout: Duration,
    pub queue_capacity: usize,
    pub require_checksum: bool,
    pub recv_buffer_size: usize,
}

impl From<&DriverConfig> for ReceiverOptions {
    fn from(config: &DriverConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            receive_timeout: config.receive_timeout,
            queue_capacity: config.packet_queue_capacity,
            require_checksum: config.require_checksum,
            recv_buffer_size: config.recv_buffer_size(),
        }
    }
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self::from(&DriverConfig::default())
    }
}

/// Receive state moved into the background thread and back out on stop.
pub struct ReceiveLoop {
    socket: Arc<UdpSocket>,
    waiter: ReadWaiter,
    queue: Arc<PacketQueue>,
    events: EventSink,
    stats: Arc<DriverStats>,
    recv_buf: Vec<u8>,
    arena: BytesMut,
    options: ReceiverOptions,
    connected: bool,
}

impl ReceiveLoop {
    /// Drains every datagram available now, waiting up to the receive
    /// timeout if there is none.
    ///
    /// Returns the number of datagrams read.
    ///
    /// # Errors
    ///
    /// Socket failures other than timeouts.
    pub fn receive_once(&mut self) -> Result<usize, ReceiverError> {
        let mut received = 0;
        let mut waited = false;
        while received < MAX_BATCH {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(Some((len, from))) => {
                    received += 1;
                    self.mark_connected(true);
                    self.classify(len, from);
                }
                Ok(None) => {
                    if received > 0 || waited {
                        break;
                    }
                    waited = true;
                    self.waiter
                        .wait(self.options.receive_timeout)
                        .inspect_err(|_e| {
                            error!(error = %_e, "poll failed");
                        })?;
                }
                // ICMP unreachable from an earlier send on this socket.
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                    debug!(error = %e, "peer unreachable");
                }
                Err(e) => {
                    error!(error = %e, "receive failed");
                    self.mark_connected(false);
                    return Err(e.into());
                }
            }
        }
        Ok(received)
    }

    fn mark_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.events.emit(Event::SocketState { connected });
        }
    }

    fn classify(&mut self, len: usize, from: Endpoint) {
        let received_ns = now_ns();
        DriverStats::add(&self.stats.packets_received, 1);
        DriverStats::add(&self.stats.bytes_received, len as u64);

        let (header, payload) =
            match parse_datagram(&self.recv_buf[..len], self.options.require_checksum) {
                Ok(parsed) => parsed,
                Err(e) => {
                    DriverStats::add(&self.stats.invalid_packets, 1);
                    debug!(from = %from, len, error = %e, "invalid packet");
                    self.events.emit(Event::InvalidPacket {
                        from: from.as_socket_addr(),
                        reason: e.to_string(),
                    });
                    return;
                }
            };
        self.arena.reserve(payload.len());
        self.arena.extend_from_slice(payload);
        let payload = self.arena.split().freeze();

        trace!(
            from = %from,
            message_id = header.message_id,
            packet = header.current_packet_id,
            packets = header.total_number_packets,
            message_type = header.message_type,
            "received fragment"
        );

        let packet = ReceivedPacket {
            endpoint: EndpointId::new(from.ip(), header.sender_id),
            source: from,
            header,
            payload,
            received_ns,
        };
        if let Some(_dropped) = self.queue.push(packet) {
            DriverStats::add(&self.stats.queue_drops, 1);
            error!(
                message_id = _dropped.header.message_id,
                capacity = self.options.queue_capacity,
                "packet queue full, dropped oldest packet"
            );
        }
    }
}

/// Owner of the bound receive socket.
pub struct PacketReceiver {
    socket: Arc<UdpSocket>,
    queue: Arc<PacketQueue>,
    idle: Option<ReceiveLoop>,
    worker: Option<(Arc<AtomicBool>, JoinHandle<ReceiveLoop>)>,
}

impl PacketReceiver {
    /// Binds `address:port`. An empty address binds the any-address of
    /// `protocol`.
    ///
    /// # Errors
    ///
    /// Address parse or bind failures.
    pub fn init(
        address: &str,
        port: u16,
        protocol: Protocol,
        options: ReceiverOptions,
        events: EventSink,
        stats: Arc<DriverStats>,
    ) -> Result<Self, ReceiverError> {
        let endpoint = Endpoint::resolve(address, port, protocol)
            .map_err(|_| ReceiverError::Address(address.to_owned()))?;
        let socket = UdpSocket::bind(endpoint).map_err(|source| {
            error!(endpoint = %endpoint, error = %source, "failed to bind UDP socket");
            ReceiverError::Bind { endpoint, source }
        })?;
        if let Err(_e) = socket.set_recv_buffer_size(options.recv_buffer_size) {
            warn!(size = options.recv_buffer_size, error = %_e, "could not size receive buffer");
        }
        let waiter = ReadWaiter::new(&socket)?;
        let socket = Arc::new(socket);
        let queue = Arc::new(PacketQueue::new(options.queue_capacity));
        info!(local = ?socket.local_addr().ok(), "receiver bound");

        let rx_loop = ReceiveLoop {
            socket: Arc::clone(&socket),
            waiter,
            queue: Arc::clone(&queue),
            events,
            stats,
            recv_buf: vec![0u8; MAX_PACKET_SIZE.max(HEADER_SIZE)],
            arena: BytesMut::with_capacity(options.max_packet_size * 64),
            options,
            connected: false,
        };
        let mut receiver = Self {
            socket,
            queue,
            idle: Some(rx_loop),
            worker: None,
        };
        if let Some(rx_loop) = receiver.idle.as_mut() {
            rx_loop.mark_connected(true);
        }
        Ok(receiver)
    }

    /// Runs the receive loop on a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Spawn`] if the thread cannot be created.
    pub fn start(&mut self) -> Result<(), ReceiverError> {
        let Some(mut rx_loop) = self.idle.take() else {
            return Ok(());
        };
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let backoff = rx_loop.options.receive_timeout;

        let handle = thread::Builder::new()
            .name("dcnet-rx".into())
            .spawn(move || {
                info!("RX thread started");
                while !thread_stop.load(Ordering::Relaxed) {
                    if rx_loop.receive_once().is_err() {
                        thread::sleep(backoff);
                    }
                }
                info!("RX thread exiting");
                rx_loop
            })
            .map_err(ReceiverError::Spawn)?;
        self.worker = Some((stop, handle));
        Ok(())
    }

    /// Stops the background thread and waits for it.
    pub fn stop(&mut self) {
        let Some((stop, handle)) = self.worker.take() else {
            return;
        };
        stop.store(true, Ordering::Relaxed);
        match handle.join() {
            Ok(rx_loop) => self.idle = Some(rx_loop),
            Err(_) => {
                error!("RX thread panicked");
            }
        }
    }

    /// Runs one pass of the receive loop on the calling thread.
    ///
    /// # Errors
    ///
    /// [`ReceiverError::Running`] while the background thread owns the loop,
    /// or the socket failure that ended the pass.
    pub fn receive_once(&mut self) -> Result<usize, ReceiverError> {
        self.idle
            .as_mut()
            .ok_or(ReceiverError::Running)?
            .receive_once()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The bound socket, for sending from the same port.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    #[must_use]
    pub fn queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.queue)
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.socket.local_addr()
    }
}

impl Drop for PacketReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}
