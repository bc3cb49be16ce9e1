//! Wall-clock nanosecond timestamps.
//!
//! Wire headers carry emission times as nanoseconds since the Unix epoch so
//! that two hosts can compare them. Reading the system clock on every
//! fragment is slow, so timestamps come from the TSC via `minstant`,
//! anchored once to the system clock.

use std::sync::OnceLock;

use minstant::{Anchor, Instant};

fn anchor() -> &'static Anchor {
    static ANCHOR: OnceLock<Anchor> = OnceLock::new();
    ANCHOR.get_or_init(Anchor::new)
}

/// Nanoseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_ns() -> i64 {
    i64::try_from(Instant::now().as_unix_nanos(anchor())).unwrap_or(i64::MAX)
}

/// Monotonic instant for measuring elapsed durations.
#[inline]
#[must_use]
pub fn monotonic() -> Instant {
    Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020_and_non_decreasing() {
        let a = now_ns();
        let b = now_ns();
        assert!(a > 1_577_836_800_000_000_000);
        assert!(b >= a);
    }
}
