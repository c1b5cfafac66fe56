use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    accepts: u64,
    total: u64,
}

/// Success/total counts over a sliding window split into equal buckets.
/// Buckets older than the window are zeroed lazily on access.
#[derive(Debug)]
pub struct RollingCounter {
    buckets: Vec<Bucket>,
    bucket_width: Duration,
    current: usize,
    current_started: Instant,
}

impl RollingCounter {
    pub fn new(buckets: usize, window: Duration, now: Instant) -> Self {
        let buckets = buckets.max(1);
        let count = u32::try_from(buckets).unwrap_or(u32::MAX);
        let bucket_width = (window / count).max(Duration::from_millis(1));
        Self {
            buckets: vec![Bucket::default(); buckets],
            bucket_width,
            current: 0,
            current_started: now,
        }
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.current_started);
        let steps = elapsed.as_nanos() / self.bucket_width.as_nanos();
        if steps == 0 {
            return;
        }
        let len = self.buckets.len();
        let Ok(steps) = usize::try_from(steps) else {
            self.reset(now);
            return;
        };
        if steps >= len {
            self.reset(now);
            return;
        }
        for _ in 0..steps {
            self.current = (self.current + 1) % len;
            self.buckets[self.current] = Bucket::default();
        }
        // steps < len, which came from a usize
        self.current_started += self.bucket_width * u32::try_from(steps).unwrap_or(u32::MAX);
    }

    fn reset(&mut self, now: Instant) {
        self.buckets.fill(Bucket::default());
        self.current = 0;
        self.current_started = now;
    }

    pub fn record(&mut self, success: bool, now: Instant) {
        self.advance(now);
        let bucket = &mut self.buckets[self.current];
        bucket.total += 1;
        if success {
            bucket.accepts += 1;
        }
    }

    /// `(accepts, total)` over the live window.
    pub fn summary(&mut self, now: Instant) -> (u64, u64) {
        self.advance(now);
        self.buckets
            .iter()
            .fold((0, 0), |(a, t), b| (a + b.accepts, t + b.total))
    }
}
