use chrono::{DateTime, Utc};
use serde::Serialize;

/// One live connection's identity, distinct from the user that owns the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSession {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub first_session: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveUser {
    pub user_id: String,
    pub session_count: u64,
    pub last_activity: DateTime<Utc>,
    pub captured_count: u64,
    pub last_capture: Option<DateTime<Utc>>,
}
