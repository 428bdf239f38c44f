use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Upload driver state.
///
/// ```text
/// Idle -> Initiating -> Uploading <-> Paused
///                        |    ^         |
///                        v    |         v
///                        Error -----> Cancelled
///                        |
///            Uploading -> Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DriverState {
    Idle = 0,
    Initiating = 1,
    Uploading = 2,
    Paused = 3,
    Completed = 4,
    Error = 5,
    Cancelled = 6,
}

impl DriverState {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Idle,
            1 => Self::Initiating,
            2 => Self::Uploading,
            3 => Self::Paused,
            4 => Self::Completed,
            5 => Self::Error,
            6 => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// No work is happening until someone sends a command (or ever again).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Error | Self::Completed | Self::Cancelled
        )
    }
}

/// Shared progress counters, safe to poll from any thread.
pub struct UploadProgress {
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
    /// Chunks the server has acknowledged.
    pub chunks_done: AtomicU32,
    pub chunks_total: AtomicU32,
    state: AtomicU8,
}

impl UploadProgress {
    pub fn new() -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            chunks_done: AtomicU32::new(0),
            chunks_total: AtomicU32::new(0),
            state: AtomicU8::new(DriverState::Idle as u8),
        }
    }

    pub fn state(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Relaxed)).unwrap_or(DriverState::Idle)
    }

    pub(crate) fn set_state(&self, state: DriverState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_totals(&self, bytes: u64, chunks: u32) {
        self.bytes_total.store(bytes, Ordering::Relaxed);
        self.chunks_total.store(chunks, Ordering::Relaxed);
    }

    pub(crate) fn set_done(&self, bytes: u64, chunks: u32) {
        self.bytes_done.store(bytes, Ordering::Relaxed);
        self.chunks_done.store(chunks, Ordering::Relaxed);
    }

    pub(crate) fn chunk_accepted(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
    }

    /// `(chunks acknowledged, total chunks)`.
    pub fn resume_point(&self) -> (u32, u32) {
        (
            self.chunks_done.load(Ordering::Relaxed),
            self.chunks_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self::new()
    }
}
