use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_engine::UploadError;
use ferry_types::{ErrorBody, ErrorCode};
use tracing::{debug, warn};

/// Error returned by every handler. Always rendered as a JSON [`ErrorBody`].
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The request could not be parsed at all.
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Upload(e) => e.code(),
            Self::BadRequest(_) => ErrorCode::InvalidRequest,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        status_for(self.code())
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::SessionMismatch | ErrorCode::IncompleteUpload => StatusCode::CONFLICT,
        ErrorCode::InvalidChunkIndex | ErrorCode::InvalidRequest | ErrorCode::ChecksumMismatch => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::SessionLocked => StatusCode::LOCKED,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Network => StatusCode::BAD_GATEWAY,
        ErrorCode::ChunkIoFailure | ErrorCode::MergeIoFailure | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        } else {
            debug!("Request rejected ({}): {}", status, self);
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (UploadError::SessionNotFound("s".into()), StatusCode::NOT_FOUND),
            (UploadError::SessionLocked("s".into()), StatusCode::LOCKED),
            (
                UploadError::InvalidChunkIndex { index: 9, total_chunks: 2 },
                StatusCode::BAD_REQUEST,
            ),
            (
                UploadError::IncompleteUpload {
                    session_id: "s".into(),
                    received: 1,
                    total_chunks: 2,
                    missing: vec![1],
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
        assert_eq!(
            ApiError::BadRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
