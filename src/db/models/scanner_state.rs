use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scanner::{Delta, OperationStatus, Position};

/// Durable form of one user's scanner. `pending` includes any unexecuted part
/// of a step that was in flight when the record was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerRecord {
    pub user_id: String,
    pub position: Position,
    pub pending: Delta,
    pub status: OperationStatus,
    pub operation_start_time: Option<DateTime<Utc>>,
    pub current_movement_duration: Option<f64>,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}
