use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Sessions --

/// Where a session's chunk payloads live until the merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// One file per chunk under the session's directory.
    #[default]
    OnDisk,
    /// Whole chunk buffered in memory and stored as a row in the session database.
    Buffered,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::OnDisk => "on_disk",
            StorageMode::Buffered => "buffered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_disk" => Some(StorageMode::OnDisk),
            "buffered" => Some(StorageMode::Buffered),
            _ => None,
        }
    }
}

/// Declared identity of an upload. Used both to start and to resume a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartSessionRequest {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub storage_mode: StorageMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSessionResponse {
    pub session_id: String,
    pub received_chunks: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub storage_mode: StorageMode,
    /// Ascending, no duplicates.
    pub received_chunks: Vec<u32>,
    pub is_complete: bool,
    pub locked: bool,
    pub last_activity: DateTime<Utc>,
}

// -- Chunks --

/// Query string of `PUT /sessions/{id}/chunks/{index}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkQuery {
    pub total_chunks: u32,
    /// Hex SHA-256 of the body; verified before the chunk is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub accepted: bool,
    /// The index was already stored; nothing was written.
    pub already_had: bool,
    pub sha256: String,
}

// -- Completion --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub final_path: String,
    pub total_size: u64,
    pub sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&StorageMode::OnDisk).unwrap();
        assert_eq!(json, "\"on_disk\"");
        let mode: StorageMode = serde_json::from_str("\"buffered\"").unwrap();
        assert_eq!(mode, StorageMode::Buffered);
        assert_eq!(StorageMode::parse(mode.as_str()), Some(mode));
        assert_eq!(StorageMode::parse("memory"), None);
    }

    #[test]
    fn start_request_defaults_to_on_disk() {
        let req: StartSessionRequest = serde_json::from_str(
            r#"{"file_name":"a.bin","file_size":10,"total_chunks":1}"#,
        )
        .unwrap();
        assert_eq!(req.storage_mode, StorageMode::OnDisk);
    }

    #[test]
    fn start_request_rejects_unknown_fields() {
        let res: Result<StartSessionRequest, _> = serde_json::from_str(
            r#"{"file_name":"a.bin","file_size":10,"total_chunks":1,"chunk_hashes":[]}"#,
        );
        assert!(res.is_err());
    }
}
