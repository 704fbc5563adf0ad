// src/time.rs - Monotonic clock and precise sleeps
//
// All timing inside the toolkit (timer queue, pacing, rate meters) runs
// on a monotonic clock anchored at first use, so values are comparable
// across threads and never jump with wall-clock adjustments.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Milliseconds since the process-local monotonic anchor.
pub fn monotonic_ms() -> u64 {
    anchor().elapsed().as_millis() as u64
}

/// Microseconds since the process-local monotonic anchor.
pub fn monotonic_us() -> u64 {
    anchor().elapsed().as_micros() as u64
}

/// Seconds since the process-local monotonic anchor.
pub fn monotonic_sec() -> u64 {
    anchor().elapsed().as_secs()
}

pub fn sleep_ms(msec: u64) {
    std::thread::sleep(Duration::from_millis(msec));
}

pub fn sleep_us(usec: u64) {
    std::thread::sleep(Duration::from_micros(usec));
}

/// Scope guard that warns when the guarded section overruns its
/// latency budget. Cheap enough to leave in hot paths.
pub struct Perf {
    tag: String,
    threshold_ms: u64,
    start_us: u64,
}

impl Perf {
    pub fn begin(tag: impl Into<String>, threshold_ms: u64) -> Self {
        Self {
            tag: tag.into(),
            threshold_ms,
            start_us: monotonic_us(),
        }
    }
}

impl Drop for Perf {
    fn drop(&mut self) {
        let elapsed_us = monotonic_us() - self.start_us;
        if elapsed_us > self.threshold_ms * 1000 {
            log::warn!(
                "{} took {} ms (> {} ms)",
                self.tag,
                elapsed_us / 1000,
                self.threshold_ms
            );
        }
    }
}

/// Format a unix timestamp (seconds) as `YYYY-MM-DD:HH:MM:SS` local time.
pub fn time_to_string(seconds: i64) -> String {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = seconds as libc::time_t;
    unsafe {
        libc::localtime_r(&t, &mut tm);
    }
    format!(
        "{}-{:02}-{:02}:{:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_sleep_ms_waits() {
        let start = monotonic_ms();
        sleep_ms(20);
        assert!(monotonic_ms() - start >= 20);
    }

    #[test]
    fn test_units_consistent() {
        let us = monotonic_us();
        let ms = monotonic_ms();
        // Microsecond reading taken first can only lag the ms reading.
        assert!(us / 1000 <= ms + 1);
    }

    #[test]
    fn test_time_to_string_epoch_format() {
        let s = time_to_string(0);
        // Local timezone shifts the date, but the shape is fixed.
        assert_eq!(s.matches(':').count(), 3);
        assert_eq!(s.matches('-').count(), 2);
    }
}
