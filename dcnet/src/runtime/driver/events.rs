//! Notifications delivered to the application.
//!
//! Every driver component gets an [`EventSink`] at construction and reports
//! through it; the application drains the paired
//! [`crossbeam_channel::Receiver`]. The channel is bounded and a full
//! channel drops the new event rather than stalling a network thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::net::EndpointId;
use crate::trace::debug;

use super::protocol::{Feedback, MessageType};
use super::reception::ReceptionStatus;
use super::session::SessionSignal;
use super::stats::DriverStats;

/// A reassembled data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub endpoint: EndpointId,
    pub message_id: i32,
    pub data: Vec<u8>,
    /// Local time the first datagram of the frame arrived.
    pub first_packet_received_ns: i64,
    /// Remote time fragment 0 was emitted.
    pub first_packet_emitted_ns: i64,
    /// Mean `reception - emission` for this sender at delivery time.
    pub clock_offset_ns: i64,
}

impl ReceivedFrame {
    /// Local arrival time of a frame captured remotely at `capture_ns`,
    /// discounting the time the sender spent before emitting it.
    #[must_use]
    pub const fn received_for_capture(&self, capture_ns: i64) -> i64 {
        self.first_packet_received_ns
            .saturating_sub(self.first_packet_emitted_ns.saturating_sub(capture_ns))
    }

    /// A remote capture timestamp expressed on the local clock.
    #[must_use]
    pub const fn capture_to_local(&self, capture_ns: i64) -> i64 {
        capture_ns.saturating_add(self.clock_offset_ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The socket started or stopped working.
    SocketState { connected: bool },
    /// A datagram failed header, size, or checksum validation.
    InvalidPacket { from: SocketAddr, reason: String },
    /// Incomplete messages were evicted after the reassembly timeout.
    MessagesTimedOut {
        endpoint: EndpointId,
        message_type: MessageType,
        count: usize,
    },
    /// A complete message arrived after a newer one of the same type.
    StaleMessageDropped {
        endpoint: EndpointId,
        message_type: MessageType,
        message_id: i32,
    },
    UnknownMessageType { endpoint: EndpointId, message_type: i8 },
    Frame(ReceivedFrame),
    /// Rolling reception quality, sent after each frame and after losses.
    ReceptionStatus {
        endpoint: EndpointId,
        status: ReceptionStatus,
    },
    /// Opaque settings payload for the application to apply.
    Settings {
        endpoint: EndpointId,
        message_type: MessageType,
        payload: Vec<u8>,
    },
    Feedback { endpoint: EndpointId, feedback: Feedback },
    Session { endpoint: EndpointId, signal: SessionSignal },
    ClockOffset {
        endpoint: EndpointId,
        offset_ns: i64,
        samples: usize,
    },
    /// A frame finished fanning out.
    FrameSent {
        message_id: i32,
        destinations: usize,
        elapsed: Duration,
    },
}

/// Producer half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<Event>,
    stats: Arc<DriverStats>,
}

impl EventSink {
    #[must_use]
    pub fn new(capacity: usize, stats: Arc<DriverStats>) -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx, stats }, rx)
    }

    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_dropped)) => {
                DriverStats::add(&self.stats.events_dropped, 1);
                debug!(event = ?_dropped, "event channel full, dropping event");
            }
            // Nobody is listening; that is the application's choice.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn full_channel_drops_and_counts() {
        let stats = Arc::new(DriverStats::default());
        let (sink, rx) = EventSink::new(1, Arc::clone(&stats));
        sink.emit(Event::SocketState { connected: true });
        sink.emit(Event::SocketState { connected: false });
        assert_eq!(rx.try_recv().unwrap(), Event::SocketState { connected: true });
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().events_dropped, 1);
    }

    #[test]
    fn frame_timestamp_alignment() {
        let frame = ReceivedFrame {
            endpoint: EndpointId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            message_id: 0,
            data: Vec::new(),
            first_packet_received_ns: 1_000_500,
            first_packet_emitted_ns: 1_000_000,
            clock_offset_ns: 400,
        };
        // Captured 300ns before emission: arrival shifts back by the same amount.
        assert_eq!(frame.received_for_capture(999_700), 1_000_200);
        assert_eq!(frame.capture_to_local(999_700), 1_000_100);
    }

    #[test]
    fn extreme_capture_stamps_saturate() {
        let frame = ReceivedFrame {
            endpoint: EndpointId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            message_id: 0,
            data: Vec::new(),
            first_packet_received_ns: 1_700_000_000_000_000_000,
            first_packet_emitted_ns: i64::MIN,
            clock_offset_ns: i64::MAX,
        };
        assert_eq!(frame.received_for_capture(i64::MAX), i64::MAX);
        assert_eq!(frame.capture_to_local(i64::MAX), i64::MAX);
    }
}
