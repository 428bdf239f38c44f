//! Client side of ferry uploads.
//!
//! [`UploadDriver`] splits a file into a [`ChunkPlan`], sends the chunks over
//! an [`UploadTransport`] with bounded concurrency and per-chunk retries, and
//! finalizes the session. Each upload is controlled through its
//! [`UploadHandle`].

pub mod config;
pub mod driver;
pub mod http;
pub mod plan;
pub mod progress;
pub mod transport;

pub use config::DriverConfig;
pub use driver::{DriverCommand, DriverError, UploadDriver, UploadFailure, UploadHandle};
pub use http::HttpTransport;
pub use plan::{ChunkPlan, DEFAULT_CHUNK_SIZE};
pub use progress::{DriverState, UploadProgress};
pub use transport::{TransportError, UploadTransport};
