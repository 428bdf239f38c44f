use chrono::{DateTime, TimeZone, Utc};
use ferry_types::{SessionStatus, StartSessionRequest, StorageMode};

/// One row of `sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub storage_mode: StorageMode,
    pub locked: bool,
    pub merged_path: Option<String>,
    pub created_at: String,
    /// Unix milliseconds.
    pub last_activity: i64,
}

impl SessionRow {
    /// Compare the immutable declared identity against a start/resume request.
    /// Returns a description of the first differing field.
    pub fn identity_diff(&self, req: &StartSessionRequest) -> Option<String> {
        if self.file_name != req.file_name {
            return Some(format!(
                "file_name is {:?}, request says {:?}",
                self.file_name, req.file_name
            ));
        }
        if self.file_size != req.file_size {
            return Some(format!(
                "file_size is {}, request says {}",
                self.file_size, req.file_size
            ));
        }
        if self.total_chunks != req.total_chunks {
            return Some(format!(
                "total_chunks is {}, request says {}",
                self.total_chunks, req.total_chunks
            ));
        }
        if self.storage_mode != req.storage_mode {
            return Some(format!(
                "storage_mode is {}, request says {}",
                self.storage_mode.as_str(),
                req.storage_mode.as_str()
            ));
        }
        None
    }

    pub fn to_status(&self, received_chunks: Vec<u32>) -> SessionStatus {
        let is_complete = received_chunks.len() == self.total_chunks as usize;
        SessionStatus {
            session_id: self.id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            total_chunks: self.total_chunks,
            storage_mode: self.storage_mode,
            received_chunks,
            is_complete,
            locked: self.locked,
            last_activity: millis_to_datetime(self.last_activity),
        }
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
