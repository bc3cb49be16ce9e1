//! Driver-wide counters, shared by all driver threads.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DriverStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub queue_drops: AtomicU64,
    pub completed_messages: AtomicU64,
    pub timed_out_messages: AtomicU64,
    pub stale_messages: AtomicU64,
    pub pool_overruns: AtomicU64,
    pub unsolicited_packets: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_queue_drops: AtomicU64,
    pub events_dropped: AtomicU64,
}

/// Point-in-time copy of [`DriverStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub queue_drops: u64,
    pub completed_messages: u64,
    pub timed_out_messages: u64,
    pub stale_messages: u64,
    pub pool_overruns: u64,
    pub unsolicited_packets: u64,
    pub fragments_sent: u64,
    pub bytes_sent: u64,
    pub send_queue_drops: u64,
    pub events_dropped: u64,
}

impl DriverStats {
    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_received: get(&self.packets_received),
            bytes_received: get(&self.bytes_received),
            invalid_packets: get(&self.invalid_packets),
            queue_drops: get(&self.queue_drops),
            completed_messages: get(&self.completed_messages),
            timed_out_messages: get(&self.timed_out_messages),
            stale_messages: get(&self.stale_messages),
            pool_overruns: get(&self.pool_overruns),
            unsolicited_packets: get(&self.unsolicited_packets),
            fragments_sent: get(&self.fragments_sent),
            bytes_sent: get(&self.bytes_sent),
            send_queue_drops: get(&self.send_queue_drops),
            events_dropped: get(&self.events_dropped),
        }
    }
}
