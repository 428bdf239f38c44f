use std::time::Duration;

use ferry_types::StorageMode;

use crate::plan::DEFAULT_CHUNK_SIZE;

/// Upload driver settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Bytes per chunk. Larger chunks mean fewer requests but more memory
    /// per in-flight upload and more to resend after a failure.
    pub chunk_size: usize,
    /// Chunk uploads in flight at once.
    pub concurrency: usize,
    /// Retries per request after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single request; exceeding it counts as a retryable failure.
    pub request_timeout: Duration,
    /// Deadline for one `complete` call. The merge takes time proportional to
    /// the file size, so `None` (the default) waits as long as it takes.
    pub finalize_timeout: Option<Duration>,
    pub storage_mode: StorageMode,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 3,
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
            finalize_timeout: None,
            storage_mode: StorageMode::OnDisk,
        }
    }
}

impl DriverConfig {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}
