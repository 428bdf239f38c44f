use ferry_types::ErrorCode;
use thiserror::Error;

pub type UploadResult<T> = Result<T, UploadError>;

/// Every way an upload operation can fail.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {session_id} does not match: {detail}")]
    SessionMismatch { session_id: String, detail: String },

    #[error("chunk index {index} is outside 0..{total_chunks}")]
    InvalidChunkIndex { index: u32, total_chunks: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session {0} is being finalized")]
    SessionLocked(String),

    #[error("session {session_id} has {received}/{total_chunks} chunks, missing {missing:?}")]
    IncompleteUpload {
        session_id: String,
        received: usize,
        total_chunks: u32,
        missing: Vec<u32>,
    },

    #[error("chunk {index} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("chunk store failure for session {session_id}: {source}")]
    ChunkIo {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("merge failed for session {session_id}: {source}")]
    MergeIo {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            UploadError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            UploadError::SessionMismatch { .. } => ErrorCode::SessionMismatch,
            UploadError::InvalidChunkIndex { .. } => ErrorCode::InvalidChunkIndex,
            UploadError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            UploadError::SessionLocked(_) => ErrorCode::SessionLocked,
            UploadError::IncompleteUpload { .. } => ErrorCode::IncompleteUpload,
            UploadError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            UploadError::ChunkIo { .. } => ErrorCode::ChunkIoFailure,
            UploadError::MergeIo { .. } => ErrorCode::MergeIoFailure,
            UploadError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn chunk_io(session_id: &str, source: std::io::Error) -> Self {
        UploadError::ChunkIo {
            session_id: session_id.to_string(),
            source,
        }
    }

    pub(crate) fn merge_io(session_id: &str, source: std::io::Error) -> Self {
        UploadError::MergeIo {
            session_id: session_id.to_string(),
            source,
        }
    }

    pub(crate) fn mismatch(session_id: &str, detail: impl Into<String>) -> Self {
        UploadError::SessionMismatch {
            session_id: session_id.to_string(),
            detail: detail.into(),
        }
    }
}
