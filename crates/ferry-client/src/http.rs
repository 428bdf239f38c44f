use std::time::Duration;

use bytes::Bytes;
use ferry_types::{
    ChunkAck, ChunkQuery, CompleteResponse, ErrorBody, ErrorCode, ResumeSessionResponse,
    SessionStatus, StartSessionRequest, StartSessionResponse,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::transport::{TransportError, UploadTransport};

/// [`UploadTransport`] over the ferry HTTP API.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl UploadTransport for HttpTransport {
    async fn start_session(&self, req: &StartSessionRequest) -> Result<String, TransportError> {
        let resp = self
            .client
            .post(self.url("/sessions"))
            .json(req)
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: StartSessionResponse = decode(resp).await?;
        Ok(body.session_id)
    }

    async fn resume_session(
        &self,
        session_id: &str,
        req: &StartSessionRequest,
    ) -> Result<Vec<u32>, TransportError> {
        let resp = self
            .client
            .post(self.url(&format!("/sessions/{}/resume", session_id)))
            .json(req)
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: ResumeSessionResponse = decode(resp).await?;
        Ok(body.received_chunks)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: u32,
        total_chunks: u32,
        data: Bytes,
        sha256: Option<&str>,
    ) -> Result<ChunkAck, TransportError> {
        let query = ChunkQuery {
            total_chunks,
            sha256: sha256.map(str::to_string),
        };
        let resp = self
            .client
            .put(self.url(&format!("/sessions/{}/chunks/{}", session_id, index)))
            .query(&query)
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(from_reqwest)?;
        decode(resp).await
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatus, TransportError> {
        let resp = self
            .client
            .get(self.url(&format!("/sessions/{}", session_id)))
            .send()
            .await
            .map_err(from_reqwest)?;
        decode(resp).await
    }

    async fn complete(&self, session_id: &str) -> Result<CompleteResponse, TransportError> {
        let resp = self
            .client
            .post(self.url(&format!("/sessions/{}/complete", session_id)))
            .send()
            .await
            .map_err(from_reqwest)?;
        decode(resp).await
    }

    async fn cancel(&self, session_id: &str) -> Result<(), TransportError> {
        let resp = self
            .client
            .delete(self.url(&format!("/sessions/{}", session_id)))
            .send()
            .await
            .map_err(from_reqwest)?;
        check(resp).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    check(resp)
        .await?
        .json::<T>()
        .await
        .map_err(|e| TransportError::new(ErrorCode::Network, format!("unreadable response: {}", e)))
}

/// Pass successful responses through; turn the rest into a `TransportError`,
/// preferring the server's own `ErrorBody`.
async fn check(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(TransportError::new(body.code, body.message)),
        Err(_) => Err(TransportError::new(
            code_for_status(status),
            format!("HTTP {}: {}", status, text),
        )),
    }
}

/// Fallback classification for responses without an `ErrorBody`, e.g. from
/// a proxy or the body-size limit.
fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::NOT_FOUND => ErrorCode::SessionNotFound,
        StatusCode::CONFLICT => ErrorCode::SessionMismatch,
        StatusCode::LOCKED => ErrorCode::SessionLocked,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorCode::Timeout,
        s if s.is_server_error() => ErrorCode::Network,
        _ => ErrorCode::InvalidRequest,
    }
}

fn from_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::new(ErrorCode::Timeout, e.to_string())
    } else {
        TransportError::new(ErrorCode::Network, e.to_string())
    }
}
