use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use ferry_types::{ChunkAck, CompleteResponse, ErrorCode, SessionStatus, StartSessionRequest};

/// A failed call to the upload service, classified by [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: ErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::new(ErrorCode::Timeout, format!("{} timed out after {:?}", what, after))
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// The upload session operations as seen from a client.
///
/// Implemented over HTTP by [`crate::HttpTransport`]; tests implement it
/// in-process.
pub trait UploadTransport: Send + Sync + 'static {
    fn start_session(
        &self,
        req: &StartSessionRequest,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    fn resume_session(
        &self,
        session_id: &str,
        req: &StartSessionRequest,
    ) -> impl Future<Output = Result<Vec<u32>, TransportError>> + Send;

    fn upload_chunk(
        &self,
        session_id: &str,
        index: u32,
        total_chunks: u32,
        data: Bytes,
        sha256: Option<&str>,
    ) -> impl Future<Output = Result<ChunkAck, TransportError>> + Send;

    fn status(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<SessionStatus, TransportError>> + Send;

    fn complete(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<CompleteResponse, TransportError>> + Send;

    fn cancel(&self, session_id: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}
