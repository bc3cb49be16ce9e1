//! Clock-offset estimation between a remote sender and this host.
//!
//! Every received `synchro` message yields one sample: local reception time
//! minus the sender's emission time. The mean over the last
//! [`CLOCK_SAMPLES`] samples estimates skew plus one-way latency, which is
//! what a consumer needs to place remote capture timestamps on the local
//! timeline.

use std::time::Duration;

/// Ring length of the rolling mean.
pub const CLOCK_SAMPLES: usize = 1000;

/// Rolling mean of `reception - emission` differences.
#[derive(Debug, Clone)]
pub struct ClockSynchronizer {
    samples: Box<[i64]>,
    next: usize,
    len: usize,
    sum: i128,
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        Self::new(CLOCK_SAMPLES)
    }
}

impl ClockSynchronizer {
    /// A ring of `capacity` samples (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity.max(1)].into_boxed_slice(),
            next: 0,
            len: 0,
            sum: 0,
        }
    }

    /// Pushes one `reception - emission` sample, overwriting the oldest once full.
    pub fn update_average_difference(&mut self, sample_ns: i64) {
        if self.len == self.samples.len() {
            self.sum -= i128::from(self.samples[self.next]);
        } else {
            self.len += 1;
        }
        self.samples[self.next] = sample_ns;
        self.sum += i128::from(sample_ns);
        self.next = (self.next + 1) % self.samples.len();
    }

    /// Mean of the recorded samples in nanoseconds, zero before the first.
    #[must_use]
    pub fn average_offset(&self) -> i64 {
        if self.len == 0 {
            return 0;
        }
        let mean = self.sum / self.len as i128;
        i64::try_from(mean).unwrap_or(if mean < 0 { i64::MIN } else { i64::MAX })
    }

    /// The mean as a magnitude and a sign (`true` if the remote clock is ahead).
    #[must_use]
    pub fn average_offset_duration(&self) -> (Duration, bool) {
        let offset = self.average_offset();
        (Duration::from_nanos(offset.unsigned_abs()), offset < 0)
    }

    /// Translates a remote timestamp into local clock terms.
    #[must_use]
    pub fn to_local_ns(&self, remote_ns: i64) -> i64 {
        remote_ns.saturating_add(self.average_offset())
    }

    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.len
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.len = 0;
        self.sum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_reports_zero() {
        let clock = ClockSynchronizer::default();
        assert_eq!(clock.average_offset(), 0);
        assert_eq!(clock.to_local_ns(123), 123);
    }

    #[test]
    fn partial_ring_is_not_biased_toward_zero() {
        let mut clock = ClockSynchronizer::default();
        clock.update_average_difference(1_000);
        clock.update_average_difference(3_000);
        assert_eq!(clock.average_offset(), 2_000);
        assert_eq!(clock.sample_count(), 2);
    }

    #[test]
    fn full_ring_drops_oldest() {
        let mut clock = ClockSynchronizer::new(3);
        for s in [10, 20, 30, 100] {
            clock.update_average_difference(s);
        }
        assert_eq!(clock.average_offset(), (20 + 30 + 100) / 3);
        assert_eq!(clock.sample_count(), 3);
    }

    #[test]
    fn negative_offsets_and_reset() {
        let mut clock = ClockSynchronizer::new(4);
        clock.update_average_difference(-5_000_000);
        let (magnitude, remote_ahead) = clock.average_offset_duration();
        assert_eq!(magnitude, Duration::from_millis(5));
        assert!(remote_ahead);
        assert_eq!(clock.to_local_ns(10_000_000), 5_000_000);

        clock.reset();
        assert_eq!(clock.average_offset(), 0);
        assert_eq!(clock.sample_count(), 0);
    }
}
