use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use ferry_types::StorageMode;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::SessionDb;
use crate::db::queries;

const CHUNK_EXT: &str = "chunk";

/// Chunk payloads keyed by `(session_id, index)`.
///
/// On-disk sessions keep one file per chunk at
/// `{root}/{session_id}/{index:08}.chunk`; buffered sessions keep one row per
/// chunk in the session database. Either way the listing reflects what was
/// actually persisted, and is what recovery and merge trust.
pub struct ChunkStore {
    root: PathBuf,
    db: Arc<SessionDb>,
}

impl ChunkStore {
    pub async fn new(root: PathBuf, db: Arc<SessionDb>) -> io::Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("Chunk storage directory: {}", root.display());
        Ok(Self { root, db })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.{}", index, CHUNK_EXT))
    }

    /// Persist a chunk. Writing the same key twice leaves one copy; on disk the
    /// payload lands in a temp file first and is renamed over the final name,
    /// so a reader never observes a half-written chunk.
    pub async fn write(
        &self,
        mode: StorageMode,
        session_id: &str,
        index: u32,
        data: &[u8],
    ) -> io::Result<()> {
        match mode {
            StorageMode::OnDisk => {
                let dir = self.session_dir(session_id);
                fs::create_dir_all(&dir).await?;

                let tmp = dir.join(format!("{:08}.{}.tmp", index, Uuid::new_v4().simple()));
                let result = async {
                    let mut file = fs::File::create(&tmp).await?;
                    file.write_all(data).await?;
                    file.sync_data().await?;
                    drop(file);
                    fs::rename(&tmp, self.chunk_path(session_id, index)).await
                }
                .await;

                if result.is_err() {
                    fs::remove_file(&tmp).await.ok();
                }
                result
            }
            StorageMode::Buffered => self
                .db
                .with_conn_mut(|conn| queries::upsert_blob(conn, session_id, index, data))
                .map_err(io::Error::other),
        }
    }

    pub async fn exists(&self, mode: StorageMode, session_id: &str, index: u32) -> io::Result<bool> {
        match mode {
            StorageMode::OnDisk => fs::try_exists(self.chunk_path(session_id, index)).await,
            StorageMode::Buffered => self
                .db
                .with_conn(|conn| queries::query_blob_len(conn, session_id, index))
                .map(|len| len.is_some())
                .map_err(io::Error::other),
        }
    }

    /// Indices literally present, from a fresh directory or table scan.
    pub async fn list_indices(&self, mode: StorageMode, session_id: &str) -> io::Result<BTreeSet<u32>> {
        match mode {
            StorageMode::OnDisk => {
                let mut entries = match fs::read_dir(self.session_dir(session_id)).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
                    Err(e) => return Err(e),
                };
                let mut indices = BTreeSet::new();
                while let Some(entry) = entries.next_entry().await? {
                    if let Some(index) = entry.file_name().to_str().and_then(parse_chunk_name) {
                        indices.insert(index);
                    }
                }
                Ok(indices)
            }
            StorageMode::Buffered => self
                .db
                .with_conn(|conn| queries::query_blob_indices(conn, session_id))
                .map_err(io::Error::other),
        }
    }

    pub async fn chunk_len(&self, mode: StorageMode, session_id: &str, index: u32) -> io::Result<u64> {
        match mode {
            StorageMode::OnDisk => Ok(fs::metadata(self.chunk_path(session_id, index)).await?.len()),
            StorageMode::Buffered => self
                .db
                .with_conn(|conn| queries::query_blob_len(conn, session_id, index))
                .map_err(io::Error::other)?
                .ok_or_else(|| missing_chunk(session_id, index)),
        }
    }

    pub async fn read(&self, mode: StorageMode, session_id: &str, index: u32) -> io::Result<Vec<u8>> {
        match mode {
            StorageMode::OnDisk => fs::read(self.chunk_path(session_id, index)).await,
            StorageMode::Buffered => self
                .db
                .with_conn(|conn| queries::query_blob(conn, session_id, index))
                .map_err(io::Error::other)?
                .ok_or_else(|| missing_chunk(session_id, index)),
        }
    }

    /// Drop one chunk. Missing is fine.
    pub async fn remove(&self, mode: StorageMode, session_id: &str, index: u32) -> io::Result<()> {
        match mode {
            StorageMode::OnDisk => match fs::remove_file(self.chunk_path(session_id, index)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
            StorageMode::Buffered => self
                .db
                .with_conn_mut(|conn| queries::delete_blob(conn, session_id, index))
                .map_err(io::Error::other),
        }
    }

    /// Delete every chunk of a session in both backends.
    pub async fn purge(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => debug!("Removed chunk directory for session {}", session_id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let rows = self
            .db
            .with_conn_mut(|conn| queries::delete_blobs(conn, session_id))
            .map_err(io::Error::other)?;
        if rows > 0 {
            debug!("Removed {} buffered chunks for session {}", rows, session_id);
        }
        Ok(())
    }

    /// Every session id that owns at least one stored chunk or a chunk directory.
    pub async fn namespaces(&self) -> io::Result<BTreeSet<String>> {
        let mut ids = self
            .db
            .with_conn(queries::query_blob_sessions)
            .map_err(io::Error::other)?;

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => {
                    ids.insert(name);
                }
                Err(name) => warn!("Skipping non-UTF-8 chunk directory {:?}", name),
            }
        }
        Ok(ids)
    }
}

/// `00000042.chunk` -> 42. Temp files and strays yield `None`.
fn parse_chunk_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(CHUNK_EXT)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn missing_chunk(session_id: &str, index: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("chunk {} of session {} is not stored", index, session_id),
    )
}
