use serde::{Deserialize, Serialize};

/// Machine-readable failure kind carried in every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionMismatch,
    InvalidChunkIndex,
    InvalidRequest,
    SessionLocked,
    IncompleteUpload,
    ChecksumMismatch,
    ChunkIoFailure,
    MergeIoFailure,
    Internal,
    /// Client side only: the request did not finish within its deadline.
    Timeout,
    /// Client side only: connection refused, reset, or an unreadable response.
    Network,
}

impl ErrorCode {
    /// Whether repeating the same request after a backoff delay can succeed
    /// without any other change on the caller's side. `SessionLocked` clears
    /// once the running merge ends.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ChunkIoFailure
                | ErrorCode::ChecksumMismatch
                | ErrorCode::SessionLocked
                | ErrorCode::Timeout
                | ErrorCode::Network
        )
    }

    /// Retryable only after the caller does something else first (send the
    /// missing chunks), not by repetition.
    pub fn is_deferred(&self) -> bool {
        matches!(self, ErrorCode::IncompleteUpload)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionMismatch => "session_mismatch",
            ErrorCode::InvalidChunkIndex => "invalid_chunk_index",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::SessionLocked => "session_locked",
            ErrorCode::IncompleteUpload => "incomplete_upload",
            ErrorCode::ChecksumMismatch => "checksum_mismatch",
            ErrorCode::ChunkIoFailure => "chunk_io_failure",
            ErrorCode::MergeIoFailure => "merge_io_failure",
            ErrorCode::Internal => "internal",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Network => "network",
        };
        f.write_str(s)
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
