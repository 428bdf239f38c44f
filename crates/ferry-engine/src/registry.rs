//! Session metadata: creation, identity checks, coverage, lock flag.
//!
//! Every mutation runs inside one writer-connection closure, so checks and
//! writes for a session cannot interleave with another mutation.

use std::collections::BTreeSet;
use std::sync::Arc;

use ferry_types::{CompleteResponse, SessionStatus, StartSessionRequest};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::SessionDb;
use crate::db::models::{SessionRow, now_millis};
use crate::db::queries;
use crate::error::{UploadError, UploadResult};

/// Outcome of recording a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marked {
    Added,
    AlreadyPresent,
}

pub struct SessionRegistry {
    db: Arc<SessionDb>,
}

impl SessionRegistry {
    pub fn new(db: Arc<SessionDb>) -> Self {
        Self { db }
    }

    /// Validate the declaration and persist an empty session.
    pub fn create(&self, req: &StartSessionRequest) -> UploadResult<SessionRow> {
        validate_declaration(req)?;

        let row = SessionRow {
            id: Uuid::new_v4().to_string(),
            file_name: req.file_name.clone(),
            file_size: req.file_size,
            total_chunks: req.total_chunks,
            storage_mode: req.storage_mode,
            locked: false,
            merged_path: None,
            created_at: String::new(),
            last_activity: now_millis(),
        };
        self.db.with_conn_mut(|conn| queries::insert_session(conn, &row))?;

        info!(
            "Session {} created: {:?}, {} bytes, {} chunks, {}",
            row.id,
            row.file_name,
            row.file_size,
            row.total_chunks,
            row.storage_mode.as_str()
        );
        Ok(row)
    }

    pub fn get(&self, id: &str) -> UploadResult<SessionRow> {
        self.db
            .with_conn(|conn| queries::query_session(conn, id))?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Fails with `SessionMismatch` if the request disagrees with any field
    /// recorded at creation.
    pub fn verify_identity(&self, row: &SessionRow, req: &StartSessionRequest) -> UploadResult<()> {
        match row.identity_diff(req) {
            Some(detail) => {
                warn!("Resume of session {} rejected: {}", row.id, detail);
                Err(UploadError::mismatch(&row.id, detail))
            }
            None => Ok(()),
        }
    }

    /// Replace the recorded coverage with what the chunk store actually holds.
    /// Returns the new coverage, ascending.
    pub fn reconcile(&self, id: &str, stored: &BTreeSet<u32>) -> UploadResult<Vec<u32>> {
        let outcome = self.db.with_tx(|tx| {
            let Some(row) = queries::query_session(tx, id)? else {
                return Ok(None);
            };
            let stored: BTreeSet<u32> = stored
                .iter()
                .copied()
                .filter(|i| *i < row.total_chunks)
                .collect();
            let recorded: BTreeSet<u32> = queries::query_received(tx, id)?.into_iter().collect();
            if recorded != stored {
                queries::replace_received(tx, id, &stored)?;
            }
            queries::touch_session(tx, id, now_millis())?;
            Ok(Some((recorded, stored)))
        })?;

        let (recorded, stored) =
            outcome.ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;
        if recorded != stored {
            warn!(
                "Session {}: registry listed {} chunks, store holds {}; store wins",
                id,
                recorded.len(),
                stored.len()
            );
        }
        Ok(stored.into_iter().collect())
    }

    /// Record that chunk `index` is stored. A repeat is a no-op, not an error.
    pub fn mark_chunk_received(&self, id: &str, index: u32) -> UploadResult<Marked> {
        let outcome = self.db.with_conn_mut(|conn| {
            let Some(row) = queries::query_session(conn, id)? else {
                return Ok(Err(UploadError::SessionNotFound(id.to_string())));
            };
            if index >= row.total_chunks {
                return Ok(Err(UploadError::InvalidChunkIndex {
                    index,
                    total_chunks: row.total_chunks,
                }));
            }
            if row.locked {
                return Ok(Err(UploadError::SessionLocked(id.to_string())));
            }
            let added = queries::insert_received(conn, id, index)?;
            queries::touch_session(conn, id, now_millis())?;
            Ok(Ok(if added { Marked::Added } else { Marked::AlreadyPresent }))
        })?;
        outcome
    }

    pub fn is_received(&self, id: &str, index: u32) -> UploadResult<bool> {
        Ok(self.db.with_conn(|conn| queries::is_received(conn, id, index))?)
    }

    /// Current coverage. Counts as activity.
    pub fn status(&self, id: &str) -> UploadResult<SessionStatus> {
        let status = self.db.with_conn_mut(|conn| {
            queries::touch_session(conn, id, now_millis())?;
            let Some(row) = queries::query_session(conn, id)? else {
                return Ok(None);
            };
            let received = queries::query_received(conn, id)?;
            Ok(Some(row.to_status(received)))
        })?;
        status.ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    pub fn list(&self) -> UploadResult<Vec<SessionStatus>> {
        let statuses = self.db.with_conn(|conn| {
            let rows = queries::query_all_sessions(conn)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let received = queries::query_received(conn, &row.id)?;
                out.push(row.to_status(received));
            }
            Ok(out)
        })?;
        Ok(statuses)
    }

    /// Set the durable lock flag and return the session as it was read under
    /// the writer lock. A flag left behind by an earlier failed merge is
    /// simply taken over; excluding concurrent merges is the merge engine's job.
    pub fn lock(&self, id: &str) -> UploadResult<SessionRow> {
        let row = self.db.with_conn_mut(|conn| {
            let Some(mut row) = queries::query_session(conn, id)? else {
                return Ok(None);
            };
            if row.locked {
                warn!("Session {}: taking over lock left by an earlier merge", id);
            }
            queries::set_locked(conn, id, true)?;
            row.locked = true;
            Ok(Some(row))
        })?;
        row.ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    pub fn unlock(&self, id: &str) -> UploadResult<()> {
        self.db.with_conn_mut(|conn| {
            queries::set_locked(conn, id, false)?;
            queries::touch_session(conn, id, now_millis())
        })?;
        Ok(())
    }

    pub fn set_merged_path(&self, id: &str, path: &str) -> UploadResult<()> {
        self.db.with_conn_mut(|conn| queries::set_merged_path(conn, id, path))?;
        Ok(())
    }

    /// Swap a merged session for its completion receipt in one transaction.
    pub fn finish(&self, id: &str, done: &CompleteResponse) -> UploadResult<()> {
        self.db.with_tx(|tx| {
            queries::insert_receipt(tx, id, done, now_millis())?;
            queries::delete_session(tx, id)?;
            Ok(())
        })?;
        Ok(())
    }

    /// What `Complete` returned for a session that has since been finished.
    pub fn receipt(&self, id: &str) -> UploadResult<Option<CompleteResponse>> {
        Ok(self.db.with_conn(|conn| queries::query_receipt(conn, id))?)
    }

    pub fn prune_receipts(&self, cutoff: i64) -> UploadResult<usize> {
        Ok(self
            .db
            .with_conn_mut(|conn| queries::delete_receipts_before(conn, cutoff))?)
    }

    /// Returns false if the session was already gone.
    pub fn delete(&self, id: &str) -> UploadResult<bool> {
        Ok(self.db.with_conn_mut(|conn| queries::delete_session(conn, id))?)
    }

    pub fn idle_sessions(&self, cutoff: i64) -> UploadResult<Vec<String>> {
        Ok(self.db.with_conn(|conn| queries::query_idle_sessions(conn, cutoff))?)
    }

    pub fn delete_if_idle(&self, id: &str, cutoff: i64) -> UploadResult<bool> {
        Ok(self
            .db
            .with_conn_mut(|conn| queries::delete_if_idle(conn, id, cutoff))?)
    }

    pub fn session_ids(&self) -> UploadResult<BTreeSet<String>> {
        Ok(self.db.with_conn_mut(queries::query_session_ids)?)
    }
}

fn validate_declaration(req: &StartSessionRequest) -> UploadResult<()> {
    let name = req.file_name.as_str();
    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::InvalidRequest("file_name must be a plain file name".into()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(UploadError::InvalidRequest(format!(
            "file_name {:?} must not contain path separators",
            name
        )));
    }
    if req.file_size == 0 && req.total_chunks != 0 {
        return Err(UploadError::InvalidRequest(
            "an empty file has zero chunks".into(),
        ));
    }
    if req.file_size > 0 && req.total_chunks == 0 {
        return Err(UploadError::InvalidRequest(
            "a non-empty file needs at least one chunk".into(),
        ));
    }
    if req.total_chunks as u64 > req.file_size {
        return Err(UploadError::InvalidRequest(format!(
            "{} chunks cannot cover {} bytes",
            req.total_chunks, req.file_size
        )));
    }
    Ok(())
}
