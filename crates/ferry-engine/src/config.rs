use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Largest chunk body accepted by default (64 MB).
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

/// Engine settings. Defaults suit a single-node deployment; `from_env` reads
/// the `FERRY_*` variables on top of them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for chunk namespaces (`chunks/`) and published files (`files/`).
    pub storage_dir: PathBuf,
    pub db_path: PathBuf,
    /// Sessions idle for longer than this are garbage collected.
    pub session_ttl: Duration,
    pub gc_interval: Duration,
    pub max_chunk_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./ferry-storage"),
            db_path: PathBuf::from("ferry-sessions.db"),
            session_ttl: Duration::from_secs(24 * 3600),
            gc_interval: Duration::from_secs(3600),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

impl EngineConfig {
    /// Everything, database included, under one directory.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            storage_dir: root.to_path_buf(),
            db_path: root.join("ferry-sessions.db"),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("FERRY_STORAGE_DIR") {
            config.storage_dir = dir.into();
        }
        if let Ok(path) = std::env::var("FERRY_DB_PATH") {
            config.db_path = path.into();
        }
        if let Some(secs) = env_u64("FERRY_SESSION_TTL_SECS")? {
            config.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FERRY_GC_INTERVAL_SECS")? {
            config.gc_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(bytes) = env_u64("FERRY_MAX_CHUNK_BYTES")? {
            config.max_chunk_bytes = bytes as usize;
        }

        Ok(config)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.storage_dir.join("chunks")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.storage_dir.join("files")
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be an unsigned integer, got {:?}", name, v)),
        Err(_) => Ok(None),
    }
}
