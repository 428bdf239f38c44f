use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use ferry_types::{CompleteResponse, StorageMode};
use rusqlite::{Connection, OptionalExtension, params};

use crate::db::models::SessionRow;

const SESSION_COLUMNS: &str = "id, file_name, file_size, total_chunks, storage_mode, locked, \
     merged_path, created_at, last_activity";

// -- Sessions --

pub fn insert_session(conn: &Connection, row: &SessionRow) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, file_name, file_size, total_chunks, storage_mode, locked, last_activity)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            &row.id,
            &row.file_name,
            row.file_size as i64,
            row.total_chunks as i64,
            row.storage_mode.as_str(),
            row.last_activity,
        ],
    )?;
    Ok(())
}

pub fn query_session(conn: &Connection, id: &str) -> Result<Option<SessionRow>> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
    let row = conn
        .query_row(&sql, [id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })
        .optional()?;

    row.map(|(id, file_name, file_size, total_chunks, mode, locked, merged_path, created_at, last_activity)| {
        let storage_mode = StorageMode::parse(&mode)
            .ok_or_else(|| anyhow!("session {} has unknown storage mode {:?}", id, mode))?;
        Ok(SessionRow {
            id,
            file_name,
            file_size: file_size as u64,
            total_chunks: total_chunks as u32,
            storage_mode,
            locked,
            merged_path,
            created_at,
            last_activity,
        })
    })
    .transpose()
}

pub fn query_all_sessions(conn: &Connection) -> Result<Vec<SessionRow>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM sessions ORDER BY last_activity DESC")?;
        stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
    };
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = query_session(conn, &id)? {
            rows.push(row);
        }
    }
    Ok(rows)
}

pub fn touch_session(conn: &Connection, id: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET last_activity = MAX(last_activity, ?1) WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

pub fn set_locked(conn: &Connection, id: &str, locked: bool) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET locked = ?1 WHERE id = ?2",
        params![locked, id],
    )?;
    Ok(())
}

pub fn set_merged_path(conn: &Connection, id: &str, path: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET merged_path = ?1 WHERE id = ?2",
        params![path, id],
    )?;
    Ok(())
}

/// Returns true if a row was deleted. `received_chunks` rows cascade.
pub fn delete_session(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
    Ok(n > 0)
}

/// Unlocked sessions whose last activity is strictly before `cutoff`.
pub fn query_idle_sessions(conn: &Connection, cutoff: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM sessions WHERE locked = 0 AND last_activity < ?1 ORDER BY last_activity",
    )?;
    let ids = stmt
        .query_map([cutoff], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Deletes the session only if it is still idle and unlocked, so activity
/// that raced the scan keeps it alive.
pub fn delete_if_idle(conn: &Connection, id: &str, cutoff: i64) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM sessions WHERE id = ?1 AND locked = 0 AND last_activity < ?2",
        params![id, cutoff],
    )?;
    Ok(n > 0)
}

pub fn query_session_ids(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM sessions")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

// -- Received chunks --

pub fn query_received(conn: &Connection, id: &str) -> Result<Vec<u32>> {
    let mut stmt = conn.prepare(
        "SELECT chunk_index FROM received_chunks WHERE session_id = ?1 ORDER BY chunk_index",
    )?;
    let indices = stmt
        .query_map([id], |row| row.get::<_, i64>(0))?
        .map(|r| r.map(|i| i as u32))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(indices)
}

pub fn is_received(conn: &Connection, id: &str, index: u32) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM received_chunks WHERE session_id = ?1 AND chunk_index = ?2",
            params![id, index as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Returns true if the index was newly recorded.
pub fn insert_received(conn: &Connection, id: &str, index: u32) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO received_chunks (session_id, chunk_index) VALUES (?1, ?2)",
        params![id, index as i64],
    )?;
    Ok(n > 0)
}

pub fn replace_received(conn: &Connection, id: &str, indices: &BTreeSet<u32>) -> Result<()> {
    conn.execute("DELETE FROM received_chunks WHERE session_id = ?1", [id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO received_chunks (session_id, chunk_index) VALUES (?1, ?2)",
    )?;
    for index in indices {
        stmt.execute(params![id, *index as i64])?;
    }
    Ok(())
}

// -- Buffered chunk payloads --

pub fn upsert_blob(conn: &Connection, id: &str, index: u32, data: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO chunk_blobs (session_id, chunk_index, data) VALUES (?1, ?2, ?3)",
        params![id, index as i64, data],
    )?;
    Ok(())
}

pub fn query_blob(conn: &Connection, id: &str, index: u32) -> Result<Option<Vec<u8>>> {
    let data = conn
        .query_row(
            "SELECT data FROM chunk_blobs WHERE session_id = ?1 AND chunk_index = ?2",
            params![id, index as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(data)
}

pub fn query_blob_len(conn: &Connection, id: &str, index: u32) -> Result<Option<u64>> {
    let len = conn
        .query_row(
            "SELECT length(data) FROM chunk_blobs WHERE session_id = ?1 AND chunk_index = ?2",
            params![id, index as i64],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(len.map(|l| l as u64))
}

pub fn query_blob_indices(conn: &Connection, id: &str) -> Result<BTreeSet<u32>> {
    let mut stmt = conn.prepare("SELECT chunk_index FROM chunk_blobs WHERE session_id = ?1")?;
    let indices = stmt
        .query_map([id], |row| row.get::<_, i64>(0))?
        .map(|r| r.map(|i| i as u32))
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(indices)
}

pub fn query_blob_sessions(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT session_id FROM chunk_blobs")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

pub fn delete_blob(conn: &Connection, id: &str, index: u32) -> Result<()> {
    conn.execute(
        "DELETE FROM chunk_blobs WHERE session_id = ?1 AND chunk_index = ?2",
        params![id, index as i64],
    )?;
    Ok(())
}

pub fn delete_blobs(conn: &Connection, id: &str) -> Result<usize> {
    let n = conn.execute("DELETE FROM chunk_blobs WHERE session_id = ?1", [id])?;
    Ok(n)
}

// -- Completion receipts --

pub fn insert_receipt(conn: &Connection, id: &str, done: &CompleteResponse, now: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO completed_uploads (session_id, final_path, total_size, sha256, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, &done.final_path, done.total_size as i64, &done.sha256, now],
    )?;
    Ok(())
}

pub fn query_receipt(conn: &Connection, id: &str) -> Result<Option<CompleteResponse>> {
    let receipt = conn
        .query_row(
            "SELECT final_path, total_size, sha256 FROM completed_uploads WHERE session_id = ?1",
            [id],
            |row| {
                Ok(CompleteResponse {
                    final_path: row.get(0)?,
                    total_size: row.get::<_, i64>(1)? as u64,
                    sha256: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(receipt)
}

pub fn delete_receipts_before(conn: &Connection, cutoff: i64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM completed_uploads WHERE completed_at < ?1",
        [cutoff],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        migrations::run(&conn).unwrap();
        conn
    }

    fn row(id: &str) -> SessionRow {
        SessionRow {
            id: id.into(),
            file_name: "video.mp4".into(),
            file_size: 1000,
            total_chunks: 4,
            storage_mode: StorageMode::Buffered,
            locked: false,
            merged_path: None,
            created_at: String::new(),
            last_activity: 100,
        }
    }

    #[test]
    fn session_round_trips_through_sqlite() {
        let conn = conn();
        insert_session(&conn, &row("s1")).unwrap();
        let back = query_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(back.file_name, "video.mp4");
        assert_eq!(back.storage_mode, StorageMode::Buffered);
        assert!(!back.locked);
        assert!(query_session(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn received_insert_is_idempotent_and_cascades() {
        let conn = conn();
        insert_session(&conn, &row("s1")).unwrap();
        assert!(insert_received(&conn, "s1", 2).unwrap());
        assert!(!insert_received(&conn, "s1", 2).unwrap());
        assert!(insert_received(&conn, "s1", 0).unwrap());
        assert_eq!(query_received(&conn, "s1").unwrap(), vec![0, 2]);

        assert!(delete_session(&conn, "s1").unwrap());
        assert!(query_received(&conn, "s1").unwrap().is_empty());
    }

    #[test]
    fn idle_delete_respects_lock_and_recent_activity() {
        let conn = conn();
        insert_session(&conn, &row("idle")).unwrap();
        insert_session(&conn, &row("locked")).unwrap();
        set_locked(&conn, "locked", true).unwrap();
        insert_session(&conn, &row("busy")).unwrap();
        touch_session(&conn, "busy", 500).unwrap();

        assert_eq!(query_idle_sessions(&conn, 200).unwrap(), vec!["idle".to_string()]);
        assert!(!delete_if_idle(&conn, "locked", 200).unwrap());
        assert!(!delete_if_idle(&conn, "busy", 200).unwrap());
        assert!(delete_if_idle(&conn, "idle", 200).unwrap());
    }

    #[test]
    fn blobs_are_keyed_by_session_and_index() {
        let conn = conn();
        upsert_blob(&conn, "s1", 1, b"bbb").unwrap();
        upsert_blob(&conn, "s1", 1, b"bbb").unwrap();
        upsert_blob(&conn, "s1", 0, b"aa").unwrap();
        upsert_blob(&conn, "s2", 0, b"z").unwrap();

        assert_eq!(query_blob_indices(&conn, "s1").unwrap(), BTreeSet::from([0, 1]));
        assert_eq!(query_blob_len(&conn, "s1", 1).unwrap(), Some(3));
        assert_eq!(query_blob(&conn, "s1", 0).unwrap().as_deref(), Some(&b"aa"[..]));
        assert_eq!(delete_blobs(&conn, "s1").unwrap(), 2);
        assert_eq!(
            query_blob_sessions(&conn).unwrap(),
            BTreeSet::from(["s2".to_string()])
        );
    }

    #[test]
    fn receipts_outlive_their_session_until_pruned() {
        let conn = conn();
        let done = CompleteResponse {
            final_path: "/srv/files/s1/video.mp4".into(),
            total_size: 1000,
            sha256: "ab".repeat(32),
        };
        insert_receipt(&conn, "s1", &done, 100).unwrap();
        insert_receipt(&conn, "s2", &done, 300).unwrap();
        assert_eq!(query_receipt(&conn, "s1").unwrap(), Some(done));
        assert!(query_receipt(&conn, "s3").unwrap().is_none());

        assert_eq!(delete_receipts_before(&conn, 200).unwrap(), 1);
        assert!(query_receipt(&conn, "s1").unwrap().is_none());
        assert!(query_receipt(&conn, "s2").unwrap().is_some());
    }
}
