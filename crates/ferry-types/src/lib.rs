//! Wire types shared by the ferry server and the upload client.

pub mod api;
pub mod error;

pub use api::{
    ChunkAck, ChunkQuery, CompleteResponse, ResumeSessionResponse, SessionStatus,
    StartSessionRequest, StartSessionResponse, StorageMode,
};
pub use error::{ErrorBody, ErrorCode};
