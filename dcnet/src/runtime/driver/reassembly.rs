//! Per-message reassembly state machine.
//!
//! One [`MessageReassembler`] handles the messages of a single type from a
//! single sender. Fragments are addressed by byte offset, so they can arrive
//! in any order; the record for a message id lives from its first fragment
//! until it completes, is superseded, times out, or loses its pool slot.
//!
//! ```text
//! Empty ──first fragment──> Accumulating ──all packets & bytes──> Complete
//!                               │
//!                               ├── newer message accepted ──> Superseded
//!                               ├── older than timeout ──────> TimedOut
//!                               └── pool slot reused ────────> Overrun
//! ```
//!
//! A completed message is handed out only if its emission time is strictly
//! newer than the last one handed out; otherwise it is stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use crate::trace::{debug, trace, warn};

use super::pool::{DEFAULT_POOL_DEPTH, FragmentRingPool, SlotHandle};
use super::protocol::{HEADER_SIZE, WireHeader};

/// Default lifetime of an incomplete message.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Why a fragment or a finished message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Header declares zero packets.
    ZeroPackets,
    /// Packet index not below the packet count.
    IndexOutOfRange,
    /// Fragment would write past the message's data size.
    OutOfBounds,
    /// Packet count, size, or type differs from the open record.
    Inconsistent,
    /// All packets arrived but the byte count does not add up.
    SizeMismatch,
    /// The pool slot was reused before the message completed.
    Overrun,
}

/// Outcome of feeding one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Fragment stored, more are needed.
    Pending,
    /// Fragment stored and the message has every packet and byte.
    Complete,
    /// Fragment index was already received.
    Duplicate,
    /// Fragment dropped; the reassembler remains usable.
    Rejected(RejectReason),
}

/// A fully reassembled message, moved out of its pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub sender_id: u32,
    pub message_id: i32,
    pub message_type: i8,
    pub data: Vec<u8>,
    /// Local time the first fragment of any index arrived.
    pub first_packet_received_ns: i64,
    /// Remote emission time of fragment 0.
    pub first_packet_emitted_ns: i64,
}

/// Result of [`MessageReassembler::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Accepted(CompletedMessage),
    /// Older than, or as old as, the last accepted message.
    Stale { message_id: i32, emitted_ns: i64 },
    /// No record, or the record is not complete yet.
    NotReady,
    /// Record dropped because its bytes could not be trusted.
    Rejected(RejectReason),
}

/// Running counters of one reassembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub stale: u64,
    pub superseded: u64,
    pub timed_out: u64,
    pub overruns: u64,
    pub rejected: u64,
    pub duplicates: u64,
}

#[derive(Debug)]
struct ReassemblyRecord {
    total_packets: u16,
    total_size: u32,
    message_type: i8,
    sender_id: u32,
    packets_received: u16,
    /// Header plus payload of every accepted datagram.
    bytes_received: usize,
    received: Vec<u64>,
    first_received_ns: i64,
    first_emitted_ns: Option<i64>,
    earliest_emitted_ns: i64,
    slot: SlotHandle,
}

impl ReassemblyRecord {
    fn has(&self, index: u16) -> bool {
        let i = index as usize;
        self.received[i / 64] & (1u64 << (i % 64)) != 0
    }

    fn mark(&mut self, index: u16) {
        let i = index as usize;
        self.received[i / 64] |= 1u64 << (i % 64);
    }

    fn matches(&self, header: &WireHeader) -> bool {
        self.total_packets == header.total_number_packets
            && self.total_size == header.total_size_bytes
            && self.message_type == header.message_type
    }

    fn is_complete(&self) -> bool {
        self.packets_received == self.total_packets
            && self.bytes_received == self.total_size as usize
    }

    fn emitted_ns(&self) -> i64 {
        self.first_emitted_ns.unwrap_or(self.earliest_emitted_ns)
    }
}

/// Reassembles messages of one type from one sender.
#[derive(Debug)]
pub struct MessageReassembler {
    pool: FragmentRingPool,
    records: HashMap<i32, ReassemblyRecord>,
    timeout_ns: i64,
    last_accepted_emitted_ns: Option<i64>,
    last_accepted_id: Option<i32>,
    last_activity_ns: i64,
    stats: ReassemblyStats,
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_DEPTH, DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

impl MessageReassembler {
    #[must_use]
    pub fn new(pool_depth: usize, timeout: Duration) -> Self {
        Self {
            pool: FragmentRingPool::new(pool_depth, 0),
            records: HashMap::new(),
            timeout_ns: i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX),
            last_accepted_emitted_ns: None,
            last_accepted_id: None,
            last_activity_ns: 0,
            stats: ReassemblyStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Number of messages currently accumulating.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    /// `true` when nothing is accumulating and no fragment arrived for
    /// longer than `idle_ns`.
    #[must_use]
    pub fn is_idle(&self, now_ns: i64, idle_ns: i64) -> bool {
        self.records.is_empty() && now_ns.saturating_sub(self.last_activity_ns) > idle_ns
    }

    /// Stores one fragment.
    ///
    /// `fragment` is the datagram payload (header excluded); its length is
    /// authoritative over the header's declared packet size.
    pub fn update(&mut self, header: &WireHeader, fragment: &[u8], now_ns: i64) -> UpdateResult {
        if header.total_number_packets == 0 {
            return self.reject_fragment(header, RejectReason::ZeroPackets);
        }
        if header.current_packet_id >= header.total_number_packets {
            return self.reject_fragment(header, RejectReason::IndexOutOfRange);
        }
        let data_size = header.data_size();
        let offset = header.data_offset as usize;
        if (header.total_size_bytes as usize)
            < header.total_number_packets as usize * HEADER_SIZE
            || offset
                .checked_add(fragment.len())
                .is_none_or(|end| end > data_size)
        {
            return self.reject_fragment(header, RejectReason::OutOfBounds);
        }

        let id = header.message_id;
        self.last_activity_ns = now_ns;
        if self.last_accepted_id == Some(id) && !self.records.contains_key(&id) {
            // Late copy of the message just handed out.
            self.stats.duplicates += 1;
            trace!(message_id = id, packet = header.current_packet_id, "fragment of delivered message");
            return UpdateResult::Duplicate;
        }
        let pool = &mut self.pool;
        let record = self.records.entry(id).or_insert_with(|| {
            trace!(
                message_id = id,
                packets = header.total_number_packets,
                data_size,
                "opened reassembly record"
            );
            ReassemblyRecord {
                total_packets: header.total_number_packets,
                total_size: header.total_size_bytes,
                message_type: header.message_type,
                sender_id: header.sender_id,
                packets_received: 0,
                bytes_received: 0,
                received: vec![0u64; (header.total_number_packets as usize).div_ceil(64)],
                first_received_ns: now_ns,
                first_emitted_ns: None,
                earliest_emitted_ns: header.creation_timestamp_ns,
                slot: pool.acquire(data_size),
            }
        });

        if !record.matches(header) {
            return self.reject_fragment(header, RejectReason::Inconsistent);
        }
        if record.has(header.current_packet_id) {
            self.stats.duplicates += 1;
            trace!(message_id = id, packet = header.current_packet_id, "duplicate fragment");
            return UpdateResult::Duplicate;
        }

        let Some(buf) = self.pool.get_mut(record.slot) else {
            self.records.remove(&id);
            self.stats.overruns += 1;
            warn!(
                message_id = id,
                depth = self.pool.depth(),
                "reassembly slot reused before completion, dropping message"
            );
            return UpdateResult::Rejected(RejectReason::Overrun);
        };
        buf[offset..offset + fragment.len()].copy_from_slice(fragment);

        record.mark(header.current_packet_id);
        record.packets_received += 1;
        record.bytes_received += HEADER_SIZE + fragment.len();
        record.earliest_emitted_ns = record.earliest_emitted_ns.min(header.creation_timestamp_ns);
        if header.current_packet_id == 0 {
            record.first_emitted_ns = Some(header.creation_timestamp_ns);
        }

        if record.packets_received < record.total_packets {
            return UpdateResult::Pending;
        }
        if record.is_complete() {
            return UpdateResult::Complete;
        }

        let bytes = record.bytes_received;
        let expected = record.total_size;
        if let Some(record) = self.records.remove(&id) {
            self.pool.release(record.slot);
        }
        self.stats.rejected += 1;
        warn!(message_id = id, bytes, expected, "all packets received but sizes disagree");
        UpdateResult::Rejected(RejectReason::SizeMismatch)
    }

    /// Hands out the message `header` belongs to, if it is complete and newer
    /// than anything handed out before.
    pub fn message_fully_received(&mut self, header: &WireHeader) -> Option<CompletedMessage> {
        match self.finish(header.message_id) {
            Completion::Accepted(msg) => Some(msg),
            _ => None,
        }
    }

    /// Finalizes message `message_id`.
    ///
    /// The record is erased whether the message is accepted or refused.
    /// Accepting a message evicts open records that were emitted before it.
    pub fn finish(&mut self, message_id: i32) -> Completion {
        if !self
            .records
            .get(&message_id)
            .is_some_and(ReassemblyRecord::is_complete)
        {
            return Completion::NotReady;
        }
        let Some(record) = self.records.remove(&message_id) else {
            return Completion::NotReady;
        };

        let emitted_ns = record.emitted_ns();
        if self
            .last_accepted_emitted_ns
            .is_some_and(|last| emitted_ns <= last)
        {
            self.pool.release(record.slot);
            self.stats.stale += 1;
            debug!(message_id, emitted_ns, "dropping stale message");
            return Completion::Stale {
                message_id,
                emitted_ns,
            };
        }

        let data_size = record.total_size as usize - record.total_packets as usize * HEADER_SIZE;
        let Some(data) = self.pool.take(record.slot, data_size) else {
            self.stats.overruns += 1;
            warn!(message_id, "completed message lost its pool slot");
            return Completion::Rejected(RejectReason::Overrun);
        };

        self.last_accepted_emitted_ns = Some(emitted_ns);
        self.last_accepted_id = Some(message_id);
        self.stats.completed += 1;
        self.evict_older_than(emitted_ns);

        Completion::Accepted(CompletedMessage {
            sender_id: record.sender_id,
            message_id,
            message_type: record.message_type,
            data,
            first_packet_received_ns: record.first_received_ns,
            first_packet_emitted_ns: emitted_ns,
        })
    }

    /// Evicts records whose first fragment arrived more than the timeout ago.
    ///
    /// Returns how many were evicted.
    pub fn check_timeout(&mut self, now_ns: i64) -> usize {
        let timeout_ns = self.timeout_ns;
        let pool = &mut self.pool;
        let before = self.records.len();
        self.records.retain(|&id, record| {
            let keep = now_ns.saturating_sub(record.first_received_ns) <= timeout_ns;
            if !keep {
                debug!(
                    message_id = id,
                    received = record.packets_received,
                    total = record.total_packets,
                    "reassembly timed out"
                );
                pool.release(record.slot);
            }
            keep
        });
        let evicted = before - self.records.len();
        self.stats.timed_out += evicted as u64;
        evicted
    }

    /// Forgets ordering history and open records, e.g. after a reconnect.
    pub fn reset(&mut self) {
        for (_, record) in self.records.drain() {
            self.pool.release(record.slot);
        }
        self.last_accepted_emitted_ns = None;
        self.last_accepted_id = None;
    }

    fn evict_older_than(&mut self, emitted_ns: i64) {
        let pool = &mut self.pool;
        let before = self.records.len();
        self.records.retain(|_, record| {
            let keep = record.earliest_emitted_ns >= emitted_ns;
            if !keep {
                pool.release(record.slot);
            }
            keep
        });
        let evicted = before - self.records.len();
        if evicted > 0 {
            debug!(evicted, "superseded incomplete messages");
            self.stats.superseded += evicted as u64;
        }
    }

    fn reject_fragment(&mut self, header: &WireHeader, reason: RejectReason) -> UpdateResult {
        self.stats.rejected += 1;
        warn!(
            message_id = header.message_id,
            packet = header.current_packet_id,
            packets = header.total_number_packets,
            reason = ?reason,
            "rejected fragment"
        );
        UpdateResult::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::driver::protocol::MessageType;

    /// Splits `data` into fragments of `chunk` payload bytes.
    fn fragments(id: i32, emitted_ns: i64, data: &[u8], chunk: usize) -> Vec<(WireHeader, Vec<u8>)> {
        let count = data.len().div_ceil(chunk).max(1);
        (0..count)
            .map(|i| {
                let start = i * chunk;
                let end = (start + chunk).min(data.len());
                let payload = data[start..end].to_vec();
                let header = WireHeader {
                    sender_id: 1,
                    message_id: id,
                    total_size_bytes: (count * HEADER_SIZE + data.len()) as u32,
                    data_offset: start as u32,
                    creation_timestamp_ns: emitted_ns,
                    total_number_packets: count as u16,
                    current_packet_id: i as u16,
                    current_packet_size_bytes: (HEADER_SIZE + payload.len()) as u16,
                    checksum: 0,
                    message_type: MessageType::DataFrame.as_i8(),
                };
                (header, payload)
            })
            .collect()
    }

    fn feed(r: &mut MessageReassembler, frags: &[(WireHeader, Vec<u8>)], order: &[usize]) -> UpdateResult {
        let mut last = UpdateResult::Pending;
        for &i in order {
            last = r.update(&frags[i].0, &frags[i].1, 0);
        }
        last
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let frags = fragments(7, 100, &data, 300);
        let mut r = MessageReassembler::default();

        assert_eq!(feed(&mut r, &frags, &[3, 1, 0]), UpdateResult::Pending);
        assert!(r.message_fully_received(&frags[0].0).is_none());
        assert_eq!(feed(&mut r, &frags, &[2]), UpdateResult::Complete);

        let msg = r.message_fully_received(&frags[2].0).unwrap();
        assert_eq!(msg.data, data);
        assert_eq!(msg.message_id, 7);
        assert_eq!(msg.first_packet_emitted_ns, 100);
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn duplicates_are_ignored() {
        let frags = fragments(1, 5, &[1u8; 20], 10);
        let mut r = MessageReassembler::default();
        assert_eq!(r.update(&frags[0].0, &frags[0].1, 0), UpdateResult::Pending);
        assert_eq!(r.update(&frags[0].0, &frags[0].1, 0), UpdateResult::Duplicate);
        assert_eq!(r.update(&frags[1].0, &frags[1].1, 0), UpdateResult::Complete);
        assert_eq!(r.stats().duplicates, 1);
    }

    #[test]
    fn malformed_fragments_leave_reassembler_usable() {
        let frags = fragments(3, 5, &[9u8; 20], 10);
        let mut r = MessageReassembler::default();

        let mut bad = frags[0].0;
        bad.total_number_packets = 0;
        assert_eq!(r.update(&bad, &frags[0].1, 0), UpdateResult::Rejected(RejectReason::ZeroPackets));

        let mut bad = frags[0].0;
        bad.current_packet_id = 2;
        assert_eq!(r.update(&bad, &frags[0].1, 0), UpdateResult::Rejected(RejectReason::IndexOutOfRange));

        let mut bad = frags[1].0;
        bad.data_offset = 15;
        assert_eq!(r.update(&bad, &frags[1].1, 0), UpdateResult::Rejected(RejectReason::OutOfBounds));

        assert_eq!(r.update(&frags[0].0, &frags[0].1, 0), UpdateResult::Pending);
        let mut bad = frags[1].0;
        bad.total_number_packets = 3;
        bad.total_size_bytes += HEADER_SIZE as u32;
        assert_eq!(r.update(&bad, &frags[1].1, 0), UpdateResult::Rejected(RejectReason::Inconsistent));

        assert_eq!(r.update(&frags[1].0, &frags[1].1, 0), UpdateResult::Complete);
        assert_eq!(r.message_fully_received(&frags[1].0).unwrap().data, vec![9u8; 20]);
    }

    #[test]
    fn older_message_completing_late_is_stale() {
        let old = fragments(1, 1_000, &[1u8; 40], 10);
        let new = fragments(2, 2_000, &[2u8; 40], 10);
        let mut r = MessageReassembler::default();

        feed(&mut r, &old, &[0, 1, 2]);
        assert_eq!(feed(&mut r, &new, &[0, 1, 2, 3]), UpdateResult::Complete);
        let accepted = r.message_fully_received(&new[0].0).unwrap();
        assert_eq!(accepted.data, vec![2u8; 40]);

        // Accepting the newer message evicted the older partial one.
        assert_eq!(r.in_flight(), 0);
        assert_eq!(r.stats().superseded, 1);

        // Whatever still arrives for it starts a fresh record that can only be stale.
        assert_eq!(feed(&mut r, &old, &[0, 1, 2, 3]), UpdateResult::Complete);
        assert_eq!(r.finish(1), Completion::Stale { message_id: 1, emitted_ns: 1_000 });
        assert_eq!(r.in_flight(), 0);
        assert_eq!(r.stats().stale, 1);
    }

    #[test]
    fn equal_emission_time_is_stale() {
        let a = fragments(1, 500, &[1u8; 5], 10);
        let b = fragments(2, 500, &[2u8; 5], 10);
        let mut r = MessageReassembler::default();
        feed(&mut r, &a, &[0]);
        assert!(r.message_fully_received(&a[0].0).is_some());
        feed(&mut r, &b, &[0]);
        assert!(r.message_fully_received(&b[0].0).is_none());
    }

    #[test]
    fn timeout_evicts_exactly_once() {
        let frags = fragments(9, 1, &[0u8; 30], 10);
        let mut r = MessageReassembler::new(4, Duration::from_millis(1000));
        r.update(&frags[0].0, &frags[0].1, 0);

        assert_eq!(r.check_timeout(999_000_000), 0);
        assert_eq!(r.check_timeout(1_000_000_001), 1);
        assert_eq!(r.check_timeout(5_000_000_000), 0);
        assert_eq!(r.stats().timed_out, 1);

        // The id is usable again afterwards.
        assert_eq!(feed(&mut r, &frags, &[2, 1, 0]), UpdateResult::Complete);
        assert_eq!(r.message_fully_received(&frags[0].0).unwrap().data.len(), 30);
    }

    #[test]
    fn overrun_is_detected() {
        let mut r = MessageReassembler::new(2, DEFAULT_REASSEMBLY_TIMEOUT);
        let a = fragments(1, 10, &[1u8; 20], 10);
        let b = fragments(2, 11, &[2u8; 20], 10);
        let c = fragments(3, 12, &[3u8; 20], 10);
        feed(&mut r, &a, &[0]);
        feed(&mut r, &b, &[0]);
        feed(&mut r, &c, &[0]);

        assert_eq!(r.update(&a[1].0, &a[1].1, 0), UpdateResult::Rejected(RejectReason::Overrun));
        assert_eq!(r.stats().overruns, 1);
        assert_eq!(feed(&mut r, &c, &[1]), UpdateResult::Complete);
        assert_eq!(r.message_fully_received(&c[0].0).unwrap().data, vec![3u8; 20]);
    }

    #[test]
    fn late_fragment_of_delivered_message_keeps_pool_rotation() {
        let mut r = MessageReassembler::new(2, DEFAULT_REASSEMBLY_TIMEOUT);
        let a = fragments(1, 10, &[1u8; 20], 10);
        let b = fragments(2, 11, &[2u8; 20], 10);
        assert_eq!(feed(&mut r, &a, &[0, 1]), UpdateResult::Complete);
        assert!(r.message_fully_received(&a[0].0).is_some());

        feed(&mut r, &b, &[0]);
        // Retransmitted copies of message 1 must not take a slot.
        assert_eq!(feed(&mut r, &a, &[0, 1, 0]), UpdateResult::Duplicate);
        assert_eq!(r.in_flight(), 1);
        assert_eq!(r.stats().duplicates, 3);

        let c = fragments(3, 12, &[3u8; 20], 10);
        feed(&mut r, &c, &[0]);
        assert_eq!(feed(&mut r, &b, &[1]), UpdateResult::Complete);
        assert_eq!(r.message_fully_received(&b[0].0).unwrap().data, vec![2u8; 20]);
        assert_eq!(r.stats().overruns, 0);
    }

    #[test]
    fn idle_only_without_open_records() {
        let frags = fragments(4, 1, &[0u8; 20], 10);
        let mut r = MessageReassembler::default();
        r.update(&frags[0].0, &frags[0].1, 100);
        assert!(!r.is_idle(10_000, 10));
        r.update(&frags[1].0, &frags[1].1, 200);
        assert!(r.message_fully_received(&frags[0].0).is_some());
        assert!(!r.is_idle(205, 10));
        assert!(r.is_idle(10_000, 10));
    }

    #[test]
    fn header_only_message_completes() {
        let frags = fragments(0, 1, &[], 10);
        assert_eq!(frags.len(), 1);
        let mut r = MessageReassembler::default();
        assert_eq!(r.update(&frags[0].0, &frags[0].1, 0), UpdateResult::Complete);
        assert!(r.message_fully_received(&frags[0].0).unwrap().data.is_empty());
    }
}
