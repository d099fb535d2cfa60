//! Millisecond/microsecond clock shared by every packet timestamp.
//!
//! The clock is anchored once per process: unix epoch time captured together
//! with a monotonic [`Instant`]. Reads advance with the monotonic timer, so
//! wall-clock jumps never affect packet ordering. Clock discipline across
//! hosts nudges a process-wide signed offset via [`set_clock_adjustment`];
//! adjustments accumulate. Reads are clamped so a negative adjustment can
//! stall the clock but never make it run backwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct Clock {
    anchor: Instant,
    /// Unix time of the anchor, in microseconds.
    base_micros: i64,
    /// Accumulated adjustment, in milliseconds.
    adjustment_ms: AtomicI64,
    /// Highest microsecond value handed out so far.
    last_micros: AtomicI64,
}

fn clock() -> &'static Clock {
    static CLOCK: OnceLock<Clock> = OnceLock::new();
    CLOCK.get_or_init(|| {
        let base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Clock {
            anchor: Instant::now(),
            base_micros: base.as_micros() as i64,
            adjustment_ms: AtomicI64::new(0),
            last_micros: AtomicI64::new(0),
        }
    })
}

fn raw_micros(c: &Clock) -> i64 {
    let elapsed = c.anchor.elapsed().as_micros() as i64;
    let adjustment = c.adjustment_ms.load(Ordering::Relaxed) * 1000;
    c.base_micros + elapsed + adjustment
}

/// Current time in microseconds, monotonic non-decreasing.
pub fn get_time_micro() -> i64 {
    let c = clock();
    let raw = raw_micros(c);
    // Clamp: hand out at least the highest value previously returned.
    let prev = c.last_micros.fetch_max(raw, Ordering::AcqRel);
    raw.max(prev)
}

/// Current time in milliseconds. This is the timestamp domain of
/// [`StreamPacket::timestamp`](crate::protocol::StreamPacket).
pub fn get_time() -> i64 {
    get_time_micro() / 1000
}

/// Current time in seconds, consistent with [`get_time_micro`].
pub fn get_time_seconds() -> f64 {
    get_time_micro() as f64 / 1_000_000.0
}

/// Accumulate `delta_ms` onto the process-wide clock offset.
///
/// Used by external clock-discipline to line this host up with a master
/// clock. Deltas add up; they do not replace each other.
pub fn set_clock_adjustment(delta_ms: i64) {
    clock().adjustment_ms.fetch_add(delta_ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic() {
        let t1 = get_time_micro();
        let t2 = get_time_micro();
        assert!(t2 >= t1);
    }

    #[test]
    fn seconds_track_micros() {
        let us = get_time_micro();
        let s = get_time_seconds();
        assert!((s - us as f64 / 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn adjustment_accumulates_and_clamps() {
        let before = get_time();
        set_clock_adjustment(500);
        set_clock_adjustment(500);
        let advanced = get_time();
        assert!(advanced >= before + 1000);

        // Undo: the clock must hold rather than run backwards.
        set_clock_adjustment(-1000);
        let after = get_time();
        assert!(after >= advanced);
    }
}
