// src/stat.rs - Sliding-window throughput meter
//
// Rates are computed over a ring of 1-second buckets: each bucket
// snapshots the cumulative count, and the rate is the delta between the
// newest and oldest snapshot divided by their time span. Updates within
// the same second only bump the cumulative count.

use crate::time::monotonic_ms;

const DEFAULT_RANGE: usize = 5;
const BUCKET_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Copy, Default)]
struct Bucket {
    count: u64,
    time_ms: u64,
}

/// Items-per-second / kbps meter over the last `range` seconds.
pub struct RateMeter {
    buckets: Vec<Bucket>,
    current: usize,
    recorded: usize,
    total: u64,
    last_bucket_ms: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE)
    }
}

impl RateMeter {
    pub fn new(range: usize) -> Self {
        let range = range.max(2);
        Self {
            buckets: vec![Bucket::default(); range],
            current: 0,
            recorded: 0,
            total: 0,
            last_bucket_ms: 0,
        }
    }

    /// Record `n` items (or bytes). A new bucket is opened at most once
    /// per second; intermediate updates accumulate into the total.
    pub fn update(&mut self, n: u64) {
        self.total += n;
        let now = monotonic_ms();
        if self.last_bucket_ms > 0 && now - self.last_bucket_ms < BUCKET_INTERVAL_MS {
            return;
        }

        self.last_bucket_ms = now;
        self.buckets[self.current] = Bucket {
            count: self.total,
            time_ms: now,
        };
        self.current = (self.current + 1) % self.buckets.len();
        if self.recorded < self.buckets.len() {
            self.recorded += 1;
        }
    }

    pub fn reset(&mut self) {
        for b in &mut self.buckets {
            *b = Bucket::default();
        }
        self.current = 0;
        self.recorded = 0;
        self.total = 0;
        self.last_bucket_ms = 0;
    }

    /// Items per second over the recorded window.
    pub fn speed(&self) -> f64 {
        if self.recorded < 2 {
            return 0.0;
        }

        let len = self.buckets.len();
        let (newest, oldest) = if self.recorded < len {
            (self.current.saturating_sub(1), 0)
        } else {
            ((len + self.current - 1) % len, self.current)
        };

        let time_diff = self.buckets[newest]
            .time_ms
            .saturating_sub(self.buckets[oldest].time_ms);
        if time_diff == 0 {
            return 0.0;
        }
        let count_diff = self.buckets[newest].count - self.buckets[oldest].count;
        count_diff as f64 * 1000.0 / time_diff as f64
    }

    /// Kilobits per second, interpreting counts as bytes.
    pub fn kbps(&self) -> f64 {
        self.speed() * 8.0 * 0.001
    }

    #[cfg(test)]
    fn total(&self) -> u64 {
        self.total
    }
}
