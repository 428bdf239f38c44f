use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Session DB: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE sessions (
                id            TEXT PRIMARY KEY,
                file_name     TEXT NOT NULL,
                file_size     INTEGER NOT NULL,
                total_chunks  INTEGER NOT NULL,
                storage_mode  TEXT NOT NULL,
                locked        INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL DEFAULT (datetime('now')),
                last_activity INTEGER NOT NULL
            );

            CREATE INDEX idx_sessions_activity ON sessions(last_activity);

            CREATE TABLE received_chunks (
                session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                PRIMARY KEY (session_id, chunk_index)
            );

            INSERT INTO schema_version (version) VALUES (1);
            "
        )?;
    }

    if version < 2 {
        // Chunk payloads of buffered sessions. Not tied to `sessions` by a
        // foreign key: the chunk store outlives and is swept independently of
        // the registry.
        info!("Session DB: running migration v2 (buffered chunk payloads, merged path)");
        conn.execute_batch(
            "
            CREATE TABLE chunk_blobs (
                session_id  TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                data        BLOB NOT NULL,
                PRIMARY KEY (session_id, chunk_index)
            );

            ALTER TABLE sessions ADD COLUMN merged_path TEXT;

            INSERT INTO schema_version (version) VALUES (2);
            "
        )?;
    }

    if version < 3 {
        // What `Complete` returned for sessions that no longer exist, so a
        // repeated `Complete` gets the same answer.
        info!("Session DB: running migration v3 (completion receipts)");
        conn.execute_batch(
            "
            CREATE TABLE completed_uploads (
                session_id   TEXT PRIMARY KEY,
                final_path   TEXT NOT NULL,
                total_size   INTEGER NOT NULL,
                sha256       TEXT NOT NULL,
                completed_at INTEGER NOT NULL
            );

            CREATE INDEX idx_completed_at ON completed_uploads(completed_at);

            INSERT INTO schema_version (version) VALUES (3);
            "
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 3);

        let merged: Option<String> = conn
            .query_row("SELECT merged_path FROM sessions LIMIT 1", [], |r| r.get(0))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .unwrap();
        assert!(merged.is_none());
    }
}
