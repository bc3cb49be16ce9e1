//! Rolling frame reception quality for one sender.
//!
//! Tracks the share of recent frames that arrived whole, the frame rate and
//! bandwidth over the last second, and a mean emission-to-delivery latency.

use std::collections::VecDeque;

/// Outcomes remembered for the success percentage.
pub const SUCCESS_WINDOW: usize = 100;

/// Latency samples averaged.
pub const LATENCY_WINDOW: usize = 100;

/// Deliveries remembered for rate and bandwidth.
const DELIVERY_WINDOW: usize = 1000;

const ONE_SECOND_NS: i64 = 1_000_000_000;

/// Snapshot reported with every delivered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceptionStatus {
    /// Share of the last [`SUCCESS_WINDOW`] frames delivered, 0..=100.
    pub success_percent: u8,
    /// Frames delivered during the last second.
    pub framerate: u32,
    /// Payload bytes delivered during the last second.
    pub bandwidth_bytes: u64,
    /// Mean of recent emission-to-delivery delays, on the local clock.
    pub average_latency_ns: i64,
}

#[derive(Debug)]
pub struct ReceptionMonitor {
    outcomes: VecDeque<bool>,
    deliveries: VecDeque<(i64, usize)>,
    latencies: VecDeque<i64>,
    latency_sum: i128,
}

impl Default for ReceptionMonitor {
    fn default() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(SUCCESS_WINDOW),
            deliveries: VecDeque::with_capacity(DELIVERY_WINDOW),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            latency_sum: 0,
        }
    }
}

impl ReceptionMonitor {
    /// Records a frame of `bytes` delivered at `now_ns` after `latency_ns`.
    pub fn record_delivery(&mut self, now_ns: i64, bytes: usize, latency_ns: i64) {
        self.push_outcome(true);

        if self.deliveries.len() == DELIVERY_WINDOW {
            self.deliveries.pop_front();
        }
        self.deliveries.push_back((now_ns, bytes));

        if self.latencies.len() == LATENCY_WINDOW
            && let Some(old) = self.latencies.pop_front()
        {
            self.latency_sum -= i128::from(old);
        }
        self.latencies.push_back(latency_ns);
        self.latency_sum += i128::from(latency_ns);
    }

    /// Records `count` frames that never made it (timed out, overrun,
    /// superseded or stale).
    pub fn record_losses(&mut self, count: usize) {
        for _ in 0..count.min(SUCCESS_WINDOW) {
            self.push_outcome(false);
        }
    }

    #[must_use]
    pub fn status(&self, now_ns: i64) -> ReceptionStatus {
        let success_percent = if self.outcomes.is_empty() {
            100
        } else {
            let ok = self.outcomes.iter().filter(|&&ok| ok).count();
            // At most 100.
            (ok * 100 / self.outcomes.len()) as u8
        };

        let since = now_ns.saturating_sub(ONE_SECOND_NS);
        let (framerate, bandwidth_bytes) = self
            .deliveries
            .iter()
            .rev()
            .take_while(|(t, _)| *t > since)
            .fold((0u32, 0u64), |(n, b), (_, bytes)| (n + 1, b + *bytes as u64));

        let average_latency_ns = if self.latencies.is_empty() {
            0
        } else {
            (self.latency_sum / self.latencies.len() as i128) as i64
        };

        ReceptionStatus {
            success_percent,
            framerate,
            bandwidth_bytes,
            average_latency_ns,
        }
    }

    fn push_outcome(&mut self, delivered: bool) {
        if self.outcomes.len() == SUCCESS_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(delivered);
    }
}
