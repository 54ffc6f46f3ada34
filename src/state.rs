use tokio::time::Instant;

use crate::progress::ProgressEvent;
use crate::sampler::ProgressSampler;

/// Mutable bookkeeping of one running transfer.
///
/// Owned by the transfer task alone and dropped when it finishes.
#[derive(Debug)]
pub struct TransferState {
    bytes_written: u64,
    total_bytes: Option<u64>,
    last_activity: Instant,
    sampler: ProgressSampler,
}

impl TransferState {
    /// Start from the number of bytes already persisted on disk.
    pub fn resume_from(bytes_on_disk: u64) -> Self {
        Self {
            bytes_written: bytes_on_disk,
            total_bytes: None,
            last_activity: Instant::now(),
            sampler: ProgressSampler::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total_bytes = total;
    }

    /// Account for `n` freshly written bytes.
    pub fn record(&mut self, n: u64) {
        let now = Instant::now();
        self.bytes_written += n;
        self.last_activity = now;
        self.sampler.add_sample_at(now, n);
    }

    /// A new connection starts with an empty throughput window.
    pub fn reconnecting(&mut self) {
        self.sampler.clear();
    }

    /// Pin an unknown total to what was actually received.
    pub fn finish(&mut self) {
        if self.total_bytes.is_none() {
            self.total_bytes = Some(self.bytes_written);
        }
    }

    pub fn snapshot(&self) -> ProgressEvent {
        ProgressEvent::new(
            self.bytes_written,
            self.total_bytes,
            self.sampler.current_throughput(),
        )
    }
}
