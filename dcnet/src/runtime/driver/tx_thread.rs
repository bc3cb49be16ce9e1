//! Send side: fragmentation, multi-destination fan-out, and the TX loop.
//!
//! A message is cut into datagrams of at most `max_packet_size` bytes,
//! header included. All fragments share the message id, total size, and
//! packet count; each carries its own byte offset and emission time.
//!
//! The TX loop owns the destination table. Control traffic (destination
//! updates, feedback, directed messages) arrives on an unbounded channel
//! and is never dropped. Frames arrive on a bounded queue that drops the
//! oldest frame when full, so a slow network only ever delays the newest
//! data. When idle the loop emits `synchro` so peers can estimate clock
//! offset.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use crossbeam_queue::ArrayQueue;
use thiserror::Error;

use crate::net::{Endpoint, EndpointId, UdpSocket};
use crate::time::{monotonic, now_ns};
use crate::trace::{debug, info, trace, warn};

use super::commands::TxCommand;
use super::events::{Event, EventSink};
use super::protocol::{HEADER_SIZE, MAX_MESSAGE_ID, MessageType, WireHeader, seal_checksum};
use super::session::Destination;
use super::stats::DriverStats;

/// Sleep between idle loop iterations.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Attempts per datagram while the socket reports `WouldBlock`.
const SEND_RETRIES: usize = 64;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("max packet size {0} leaves no room for payload")]
    PacketSizeTooSmall(usize),
    #[error("message of {len} bytes needs more than {max} fragments")]
    MessageTooLarge { len: usize, max: usize },
}

/// Cuts `payload` into ready-to-send datagrams for message `message_id`.
///
/// An empty payload yields one header-only datagram.
///
/// # Errors
///
/// The fragment size leaves no room for payload, or the message needs more
/// fragments or bytes than the header can describe.
pub fn fragment_message(
    sender_id: u32,
    message_type: MessageType,
    message_id: i32,
    payload: &[u8],
    max_packet_size: usize,
    checksum: bool,
) -> Result<Vec<Vec<u8>>, SendError> {
    let max_packet_size = max_packet_size.min(u16::MAX as usize);
    if max_packet_size <= HEADER_SIZE {
        return Err(SendError::PacketSizeTooSmall(max_packet_size));
    }
    let chunk = max_packet_size - HEADER_SIZE;
    let count = payload.len().div_ceil(chunk).max(1);
    let too_large = SendError::MessageTooLarge {
        len: payload.len(),
        max: u16::MAX as usize,
    };
    let total_number_packets = u16::try_from(count).map_err(|_| too_large)?;
    let total_size_bytes = u32::try_from(count * HEADER_SIZE + payload.len()).map_err(|_| {
        SendError::MessageTooLarge {
            len: payload.len(),
            max: u16::MAX as usize,
        }
    })?;

    let mut fragments = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * chunk;
        let end = (start + chunk).min(payload.len());
        let body = &payload[start..end];
        let size = HEADER_SIZE + body.len();

        let header = WireHeader {
            sender_id,
            message_id,
            total_size_bytes,
            // Bounded by total_size_bytes, which fits in u32.
            data_offset: start as u32,
            creation_timestamp_ns: now_ns(),
            total_number_packets,
            current_packet_id: index as u16,
            current_packet_size_bytes: size as u16,
            checksum: 0,
            message_type: message_type.as_i8(),
        };
        let mut datagram = vec![0u8; size];
        header.write_to(&mut datagram);
        datagram[HEADER_SIZE..].copy_from_slice(body);
        if checksum {
            seal_checksum(&mut datagram);
        }
        fragments.push(datagram);
    }
    Ok(fragments)
}

/// Fragments messages and sends them to one or many destinations.
pub struct PacketSender {
    socket: Arc<UdpSocket>,
    sender_id: u32,
    checksum: bool,
    next_ids: [i32; MessageType::ALL.len()],
    stats: Arc<DriverStats>,
}

impl PacketSender {
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, sender_id: u32, checksum: bool, stats: Arc<DriverStats>) -> Self {
        Self {
            socket,
            sender_id,
            checksum,
            next_ids: [0; MessageType::ALL.len()],
            stats,
        }
    }

    #[must_use]
    pub const fn sender_id(&self) -> u32 {
        self.sender_id
    }

    /// Allocates the next id for `message_type`, wrapping after
    /// [`MAX_MESSAGE_ID`].
    pub fn next_message_id(&mut self, message_type: MessageType) -> i32 {
        let slot = &mut self.next_ids[message_type.as_i8() as usize];
        let id = *slot;
        *slot = if id >= MAX_MESSAGE_ID { 0 } else { id + 1 };
        id
    }

    /// Fragments `payload` under a freshly allocated message id.
    ///
    /// # Errors
    ///
    /// See [`fragment_message`].
    pub fn generate_fragments(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
        max_fragment_size: usize,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let id = self.next_message_id(message_type);
        self.generate_fragments_with_id(message_type, id, payload, max_fragment_size)
    }

    /// # Errors
    ///
    /// See [`fragment_message`].
    pub fn generate_fragments_with_id(
        &self,
        message_type: MessageType,
        message_id: i32,
        payload: &[u8],
        max_fragment_size: usize,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        fragment_message(
            self.sender_id,
            message_type,
            message_id,
            payload,
            max_fragment_size,
            self.checksum,
        )
    }

    /// Sends every fragment to every destination, one scoped thread per
    /// destination.
    ///
    /// Returns how many destinations received at least one byte.
    pub fn send_to_all(&self, fragments: &[Vec<u8>], destinations: &[Endpoint]) -> usize {
        match destinations {
            [] => 0,
            [only] => usize::from(self.send_all_fragments(fragments, *only) > 0),
            many => thread::scope(|scope| {
                let handles: Vec<_> = many
                    .iter()
                    .map(|&dest| scope.spawn(move || self.send_all_fragments(fragments, dest)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(0))
                    .filter(|&bytes| bytes > 0)
                    .count()
            }),
        }
    }

    fn send_all_fragments(&self, fragments: &[Vec<u8>], dest: Endpoint) -> usize {
        let mut sent = 0;
        for fragment in fragments {
            match self.send_with_retry(fragment, dest) {
                Ok(n) => {
                    sent += n;
                    DriverStats::add(&self.stats.fragments_sent, 1);
                }
                Err(_e) => {
                    warn!(dest = %dest, error = %_e, "send failed, skipping destination");
                    break;
                }
            }
        }
        DriverStats::add(&self.stats.bytes_sent, sent as u64);
        sent
    }

    fn send_with_retry(&self, datagram: &[u8], dest: Endpoint) -> io::Result<usize> {
        for _ in 0..SEND_RETRIES {
            if let Some(n) = self.socket.try_send_to(datagram, dest)? {
                return Ok(n);
            }
            thread::yield_now();
        }
        Err(io::Error::new(ErrorKind::WouldBlock, "socket send buffer stayed full"))
    }
}

/// TX thread state and event loop.
pub struct TxThread {
    sender: PacketSender,
    commands: Receiver<TxCommand>,
    frames: Arc<ArrayQueue<Vec<u8>>>,
    destinations: HashMap<EndpointId, Destination>,
    events: EventSink,
    max_packet_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl TxThread {
    #[must_use]
    pub fn new(
        sender: PacketSender,
        commands: Receiver<TxCommand>,
        frames: Arc<ArrayQueue<Vec<u8>>>,
        events: EventSink,
        max_packet_size: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sender,
            commands,
            frames,
            destinations: HashMap::new(),
            events,
            max_packet_size,
            shutdown,
        }
    }

    /// Runs until `Shutdown`, the shutdown flag, or every command sender
    /// is gone.
    pub fn run(&mut self) {
        loop {
            while let Ok(cmd) = self.commands.try_recv() {
                if !self.apply(cmd) {
                    return;
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }

            if let Some(frame) = self.frames.pop() {
                self.send_frame(&frame);
                self.send_synchro();
                continue;
            }

            self.send_synchro();
            match self.commands.recv_timeout(IDLE_WAIT) {
                Ok(cmd) => {
                    if !self.apply(cmd) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Returns `false` on shutdown.
    fn apply(&mut self, cmd: TxCommand) -> bool {
        match cmd {
            TxCommand::AddDestination(id, dest) => {
                info!(endpoint = %id, dest = %dest.endpoint, "TX: adding destination");
                self.destinations.insert(id, dest);
            }
            TxCommand::RemoveDestination(id) => {
                info!(endpoint = %id, "TX: removing destination");
                self.destinations.remove(&id);
            }
            TxCommand::SendTo {
                to,
                message_type,
                payload,
            } => {
                let id = self.sender.next_message_id(message_type);
                match self
                    .sender
                    .generate_fragments_with_id(message_type, id, &payload, self.max_packet_size)
                {
                    Ok(fragments) => {
                        trace!(to = %to, message_type = %message_type, "TX: directed message");
                        self.sender.send_to_all(&fragments, &[to]);
                    }
                    Err(_e) => {
                        warn!(error = %_e, "TX: cannot fragment directed message");
                    }
                }
            }
            TxCommand::Broadcast {
                message_type,
                payload,
            } => {
                self.fan_out(message_type, &payload);
            }
            TxCommand::Shutdown => {
                debug!("TX: shutdown command received");
                return false;
            }
        }
        true
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let started = monotonic();
        if let Some((message_id, reached)) = self.fan_out(MessageType::DataFrame, frame) {
            self.events.emit(Event::FrameSent {
                message_id,
                destinations: reached,
                elapsed: started.elapsed(),
            });
        }
    }

    fn send_synchro(&mut self) {
        if !self.destinations.is_empty() {
            self.fan_out(MessageType::Synchro, &[]);
        }
    }

    /// Sends one message to every destination, fragmenting once per
    /// distinct packet size. Returns the id used and destinations reached.
    fn fan_out(&mut self, message_type: MessageType, payload: &[u8]) -> Option<(i32, usize)> {
        if self.destinations.is_empty() {
            trace!(message_type = %message_type, "TX: no destinations");
            return None;
        }
        let mut by_size: BTreeMap<usize, Vec<Endpoint>> = BTreeMap::new();
        for dest in self.destinations.values() {
            by_size
                .entry(dest.max_packet_size.min(self.max_packet_size))
                .or_default()
                .push(dest.endpoint);
        }

        let message_id = self.sender.next_message_id(message_type);
        let mut reached = 0;
        for (size, endpoints) in &by_size {
            match self
                .sender
                .generate_fragments_with_id(message_type, message_id, payload, *size)
            {
                Ok(fragments) => reached += self.sender.send_to_all(&fragments, endpoints),
                Err(_e) => {
                    warn!(size, error = %_e, message_type = %message_type, "TX: cannot fragment message");
                }
            }
        }
        Some((message_id, reached))
    }
}
