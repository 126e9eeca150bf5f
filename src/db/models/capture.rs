use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scanner::Position;

/// One capture event. The same cell may be captured many times.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEntry {
    pub user_id: String,
    pub session_id: Option<String>,
    pub position: Position,
    pub captured_at: DateTime<Utc>,
}

impl CaptureEntry {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>, position: Position) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            position,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub id: i64,
    pub session_id: Option<String>,
    pub user_id: String,
    pub position: Position,
    pub captured_at: DateTime<Utc>,
}
