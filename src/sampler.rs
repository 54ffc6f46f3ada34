//! Rolling-window throughput measurement.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Samples older than this (relative to the newest one) are dropped.
pub const WINDOW: Duration = Duration::from_millis(1000);

/// Lower bound on the window span used as the divisor.
const MIN_SPAN_SECS: f64 = 0.1;

/// Trailing window of `(timestamp, bytes)` samples.
#[derive(Debug, Clone, Default)]
pub struct ProgressSampler {
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` read just now.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    /// Record `bytes` read at `at`. Timestamps must not go backwards.
    pub fn add_sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.prune(at);
    }

    fn prune(&mut self, newest: Instant) {
        while let Some(&(ts, _)) = self.samples.front() {
            if newest.duration_since(ts) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the retained window, 0 when empty.
    pub fn current_throughput(&self) -> f64 {
        let (Some(&(oldest, _)), Some(&(newest, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        let span = newest.duration_since(oldest).as_secs_f64().max(MIN_SPAN_SECS);
        total as f64 / span
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Forget all samples, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[cfg(test)]
    fn oldest_age(&self) -> Option<Duration> {
        let (oldest, _) = self.samples.front()?;
        let (newest, _) = self.samples.back()?;
        Some(newest.duration_since(*oldest))
    }
}
