use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_types::{ChunkAck, CompleteResponse, SessionStatus, StartSessionRequest};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::chunk_store::ChunkStore;
use crate::config::EngineConfig;
use crate::db::SessionDb;
use crate::error::{UploadError, UploadResult};
use crate::gc::{GarbageCollector, GcReport};
use crate::merge::MergeEngine;
use crate::registry::{Marked, SessionRegistry};

/// The operations a transport layer exposes to upload clients.
pub struct UploadService {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    store: Arc<ChunkStore>,
    merges: Arc<MergeEngine>,
    gc: GarbageCollector,
}

impl UploadService {
    /// Open (or create) the session database and storage directories.
    /// Sessions from a previous run are picked up as they were left.
    pub async fn open(config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_dir).await?;
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = Arc::new(SessionDb::open(&config.db_path)?);
        let registry = Arc::new(SessionRegistry::new(db.clone()));
        let store = Arc::new(ChunkStore::new(config.chunks_dir(), db).await?);
        let merges = Arc::new(MergeEngine::new(registry.clone(), store.clone(), config.files_dir()).await?);
        let gc = GarbageCollector::new(registry.clone(), store.clone(), merges.clone(), config.session_ttl);

        Ok(Self {
            config,
            registry,
            store,
            merges,
            gc,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn start_session(&self, req: &StartSessionRequest) -> UploadResult<String> {
        Ok(self.registry.create(req)?.id)
    }

    /// Reattach to a session by its declared identity. Coverage comes from a
    /// fresh scan of the chunk store, not from what the registry remembers.
    pub async fn resume_session(&self, session_id: &str, req: &StartSessionRequest) -> UploadResult<Vec<u32>> {
        let row = self.registry.get(session_id)?;
        self.registry.verify_identity(&row, req)?;

        let stored = self
            .store
            .list_indices(row.storage_mode, session_id)
            .await
            .map_err(|e| UploadError::chunk_io(session_id, e))?;
        let received = self.registry.reconcile(session_id, &stored)?;

        info!(
            "Session {} resumed: {}/{} chunks present",
            session_id,
            received.len(),
            row.total_chunks
        );
        Ok(received)
    }

    /// Store one chunk. `total_chunks` must repeat the count declared at
    /// start; `sha256`, if given, must match the payload.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        index: u32,
        total_chunks: u32,
        data: &[u8],
        sha256: Option<&str>,
    ) -> UploadResult<ChunkAck> {
        let row = self.registry.get(session_id)?;

        if total_chunks != row.total_chunks {
            return Err(UploadError::mismatch(
                session_id,
                format!(
                    "chunk {} claims {} total chunks, session declared {}",
                    index, total_chunks, row.total_chunks
                ),
            ));
        }
        if index >= row.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index,
                total_chunks: row.total_chunks,
            });
        }
        if row.locked {
            return Err(UploadError::SessionLocked(session_id.to_string()));
        }
        if data.is_empty() || data.len() as u64 > row.file_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk {} has {} bytes; file is {} bytes",
                index,
                data.len(),
                row.file_size
            )));
        }
        if data.len() > self.config.max_chunk_bytes {
            return Err(UploadError::InvalidRequest(format!(
                "chunk {} has {} bytes, limit is {}",
                index,
                data.len(),
                self.config.max_chunk_bytes
            )));
        }

        let actual = hex::encode(Sha256::digest(data));
        if let Some(expected) = sha256 {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(UploadError::ChecksumMismatch {
                    index,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        // Already recorded and still physically present: skip the write.
        if self.registry.is_received(session_id, index)?
            && self
                .store
                .exists(row.storage_mode, session_id, index)
                .await
                .map_err(|e| UploadError::chunk_io(session_id, e))?
        {
            self.registry.mark_chunk_received(session_id, index)?;
            debug!("Session {}: chunk {} already stored", session_id, index);
            return Ok(ChunkAck {
                accepted: true,
                already_had: true,
                sha256: actual,
            });
        }

        self.store
            .write(row.storage_mode, session_id, index, data)
            .await
            .map_err(|e| UploadError::chunk_io(session_id, e))?;
        let marked = self.registry.mark_chunk_received(session_id, index)?;

        debug!(
            "Session {}: chunk {}/{} stored ({} bytes)",
            session_id,
            index,
            row.total_chunks,
            data.len()
        );
        Ok(ChunkAck {
            accepted: true,
            already_had: marked == Marked::AlreadyPresent,
            sha256: actual,
        })
    }

    pub async fn get_status(&self, session_id: &str) -> UploadResult<SessionStatus> {
        self.registry.status(session_id)
    }

    /// Merge and publish. Fails with `IncompleteUpload` unless every chunk is
    /// stored, and with `SessionLocked` while another merge of the session runs.
    /// Repeating it after success returns the same response.
    ///
    /// The merge runs on its own task and finishes even if the caller stops
    /// waiting for it.
    pub async fn complete(&self, session_id: &str) -> UploadResult<CompleteResponse> {
        let merges = self.merges.clone();
        let id = session_id.to_string();
        tokio::spawn(async move { merges.finalize(&id).await })
            .await
            .map_err(|e| UploadError::Internal(anyhow::anyhow!("merge task failed: {}", e)))?
    }

    /// Drop a session and its chunks. Refused while its merge is running.
    pub async fn cancel(&self, session_id: &str) -> UploadResult<()> {
        if self.merges.is_running(session_id) {
            return Err(UploadError::SessionLocked(session_id.to_string()));
        }
        self.registry.get(session_id)?;

        self.store
            .purge(session_id)
            .await
            .map_err(|e| UploadError::chunk_io(session_id, e))?;
        self.registry.delete(session_id)?;

        info!("Session {} cancelled", session_id);
        Ok(())
    }

    pub async fn list_sessions(&self) -> UploadResult<Vec<SessionStatus>> {
        self.registry.list()
    }

    pub async fn collect_garbage(&self) -> UploadResult<GcReport> {
        self.gc.collect_at(Utc::now()).await
    }

    /// A collection pass with an explicit clock.
    pub async fn collect_garbage_at(&self, now: DateTime<Utc>) -> UploadResult<GcReport> {
        self.gc.collect_at(now).await
    }
}
