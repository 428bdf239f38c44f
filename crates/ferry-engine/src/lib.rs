//! Ferry engine: resumable chunked upload sessions.
//!
//! - `registry`: session metadata in SQLite, the single source of truth for
//!   identity, coverage, and the merge lock
//! - `chunk_store`: chunk payloads, one file or one row per chunk
//! - `merge`: ordered, verified, all-or-nothing reassembly
//! - `gc`: reclaims idle sessions and orphaned chunks
//! - `service`: the operations exposed to transports

pub mod chunk_store;
pub mod config;
pub mod db;
pub mod error;
pub mod gc;
pub mod merge;
pub mod registry;
pub mod service;

pub use config::EngineConfig;
pub use error::{UploadError, UploadResult};
pub use gc::{GcReport, run_gc_loop};
pub use service::UploadService;
