//! Ordered merge of a session's chunks into the published file.
//!
//! ```text
//! Idle -> Verifying -> Streaming -> Finalized
//!            |             |
//!            +--> Failed <-+
//! ```
//!
//! Verifying failures release the lock and leave the session resumable.
//! Streaming failures keep the lock and the chunks, so `Complete` can be
//! retried; nothing is published until the whole stream has been synced.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ferry_types::CompleteResponse;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::chunk_store::ChunkStore;
use crate::db::models::SessionRow;
use crate::error::{UploadError, UploadResult};
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Idle,
    Verifying,
    Streaming,
    Finalized,
    Failed,
}

pub struct MergeEngine {
    registry: Arc<SessionRegistry>,
    store: Arc<ChunkStore>,
    output_dir: PathBuf,
    /// Sessions with a merge running in this process.
    running: Mutex<HashSet<String>>,
}

/// Holds a session's slot in `running` until dropped.
struct RunningMerge<'a> {
    running: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for RunningMerge<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.session_id);
        }
    }
}

impl MergeEngine {
    pub async fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<ChunkStore>,
        output_dir: PathBuf,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(&output_dir).await?;
        info!("Merged file directory: {}", output_dir.display());
        Ok(Self {
            registry,
            store,
            output_dir,
            running: Mutex::new(HashSet::new()),
        })
    }

    /// Whether a merge of this session is running right now.
    pub fn is_running(&self, session_id: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(session_id))
            .unwrap_or(false)
    }

    fn claim(&self, session_id: &str) -> UploadResult<RunningMerge<'_>> {
        let mut running = self
            .running
            .lock()
            .map_err(|e| anyhow::anyhow!("Merge set lock poisoned: {}", e))?;
        if !running.insert(session_id.to_string()) {
            return Err(UploadError::SessionLocked(session_id.to_string()));
        }
        Ok(RunningMerge {
            running: &self.running,
            session_id: session_id.to_string(),
        })
    }

    /// Where a session's file is published.
    pub fn final_path(&self, row: &SessionRow) -> PathBuf {
        self.output_dir.join(&row.id).join(&row.file_name)
    }

    /// Verify, stream, publish, clean up. Exactly one call per session can be
    /// inside this at a time; others get `SessionLocked`. Once a session has
    /// been finalized, further calls return the same response.
    pub async fn finalize(&self, session_id: &str) -> UploadResult<CompleteResponse> {
        let _claim = self.claim(session_id)?;
        let row = match self.registry.lock(session_id) {
            Ok(row) => row,
            Err(UploadError::SessionNotFound(id)) => {
                return match self.registry.receipt(&id)? {
                    Some(done) => {
                        debug!("Session {}: already finalized at {}", id, done.final_path);
                        Ok(done)
                    }
                    None => Err(UploadError::SessionNotFound(id)),
                };
            }
            Err(e) => return Err(e),
        };

        if let Some(published) = row.merged_path.clone() {
            return self.finish_published(&row, Path::new(&published)).await;
        }

        phase(session_id, MergePhase::Verifying);
        if let Err(e) = self.verify(&row).await {
            phase(session_id, MergePhase::Failed);
            self.registry.unlock(session_id)?;
            return Err(e);
        }

        phase(session_id, MergePhase::Streaming);
        let final_path = self.final_path(&row);
        let (total_size, sha256) = match self.stream(&row, &final_path).await {
            Ok(out) => out,
            Err(e) => {
                phase(session_id, MergePhase::Failed);
                warn!("Session {}: merge failed, keeping it locked for retry: {}", session_id, e);
                return Err(UploadError::merge_io(session_id, e));
            }
        };

        let final_str = final_path.to_string_lossy().into_owned();
        self.registry.set_merged_path(session_id, &final_str)?;
        self.release_chunks(&row).await;

        let done = CompleteResponse {
            final_path: final_str,
            total_size,
            sha256,
        };
        self.registry.finish(session_id, &done)?;
        phase(session_id, MergePhase::Finalized);

        info!(
            "Session {} merged: {} bytes -> {} (sha256 {})",
            session_id, done.total_size, done.final_path, done.sha256
        );
        Ok(done)
    }

    /// Re-derive coverage from the store and check it against the declaration.
    async fn verify(&self, row: &SessionRow) -> UploadResult<()> {
        let id = row.id.as_str();
        let stored = self
            .store
            .list_indices(row.storage_mode, id)
            .await
            .map_err(|e| UploadError::chunk_io(id, e))?;
        let covered = self.registry.reconcile(id, &stored)?;

        if covered.len() != row.total_chunks as usize {
            let missing: Vec<u32> = (0..row.total_chunks)
                .filter(|i| !stored.contains(i))
                .collect();
            warn!(
                "Session {}: finalize refused, {}/{} chunks stored",
                id,
                covered.len(),
                row.total_chunks
            );
            return Err(UploadError::IncompleteUpload {
                session_id: id.to_string(),
                received: covered.len(),
                total_chunks: row.total_chunks,
                missing,
            });
        }

        let mut total: u64 = 0;
        for index in 0..row.total_chunks {
            total += self
                .store
                .chunk_len(row.storage_mode, id, index)
                .await
                .map_err(|e| UploadError::chunk_io(id, e))?;
        }
        if total != row.file_size {
            warn!(
                "Session {}: chunks hold {} bytes, declared {}",
                id, total, row.file_size
            );
            return Err(UploadError::mismatch(
                id,
                format!("stored chunks total {} bytes, declared file_size {}", total, row.file_size),
            ));
        }

        Ok(())
    }

    /// Append chunks in ascending index order to a temp file, sync it, then
    /// rename it onto `final_path`.
    async fn stream(&self, row: &SessionRow, final_path: &Path) -> std::io::Result<(u64, String)> {
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir.clone());
        fs::create_dir_all(&dir).await?;
        let partial = dir.join(format!(".{}.partial", row.file_name));

        let result = async {
            let mut out = fs::File::create(&partial).await?;
            let mut hasher = Sha256::new();
            let mut written: u64 = 0;

            for index in 0..row.total_chunks {
                let data = self.store.read(row.storage_mode, &row.id, index).await?;
                hasher.update(&data);
                out.write_all(&data).await?;
                written += data.len() as u64;

                if index % 100 == 0 {
                    debug!(
                        "Session {}: merged chunk {}/{} ({} bytes so far)",
                        row.id, index, row.total_chunks, written
                    );
                }
            }

            out.flush().await?;
            out.sync_all().await?;
            drop(out);

            if written != row.file_size {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("merged {} bytes, expected {}", written, row.file_size),
                ));
            }

            fs::rename(&partial, final_path).await?;
            Ok((written, hex::encode(hasher.finalize())))
        }
        .await;

        if result.is_err() {
            fs::remove_file(&partial).await.ok();
        }
        result
    }

    /// The file was published by an earlier attempt that died before cleanup.
    async fn finish_published(&self, row: &SessionRow, path: &Path) -> UploadResult<CompleteResponse> {
        info!(
            "Session {}: already published at {}, finishing cleanup",
            row.id,
            path.display()
        );
        let (total_size, sha256) = hash_file(path)
            .await
            .map_err(|e| UploadError::merge_io(&row.id, e))?;

        self.release_chunks(row).await;
        let done = CompleteResponse {
            final_path: path.to_string_lossy().into_owned(),
            total_size,
            sha256,
        };
        self.registry.finish(&row.id, &done)?;
        phase(&row.id, MergePhase::Finalized);
        Ok(done)
    }

    /// Drop chunks one by one in index order, then the namespace. Failures
    /// only leave garbage for the orphan sweep.
    async fn release_chunks(&self, row: &SessionRow) {
        for index in 0..row.total_chunks {
            if let Err(e) = self.store.remove(row.storage_mode, &row.id, index).await {
                warn!("Session {}: failed to remove chunk {}: {}", row.id, index, e);
            }
        }
        if let Err(e) = self.store.purge(&row.id).await {
            warn!("Session {}: failed to purge chunk namespace: {}", row.id, e);
        }
    }
}

fn phase(session_id: &str, phase: MergePhase) {
    debug!("Session {}: merge {:?}", session_id, phase);
}

async fn hash_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 4 * 1024 * 1024]; // 4 MB read buffer
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}
