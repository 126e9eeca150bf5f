use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::scanner::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    QueueMove,
    MoveStart,
    MoveComplete,
    FocusStart,
    Capture,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::QueueMove => "queue_move",
            OperationKind::MoveStart => "move_start",
            OperationKind::MoveComplete => "move_complete",
            OperationKind::FocusStart => "focus_start",
            OperationKind::Capture => "capture",
        }
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "queue_move" => Ok(OperationKind::QueueMove),
            "move_start" => Ok(OperationKind::MoveStart),
            "move_complete" => Ok(OperationKind::MoveComplete),
            "focus_start" => Ok(OperationKind::FocusStart),
            "capture" => Ok(OperationKind::Capture),
            other => Err(anyhow!("unknown operation type '{other}'")),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit entry. Never replayed into state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub session_id: Option<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: OperationKind,
    pub position: Position,
    pub duration: Option<f64>,
    pub details: Option<String>,
}

impl OperationLogEntry {
    pub fn new(
        user_id: impl Into<String>,
        session_id: Option<String>,
        kind: OperationKind,
        position: Position,
    ) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            kind,
            position,
            duration: None,
            details: None,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: i64,
    pub session_id: Option<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationKind,
    pub position: Position,
    pub duration: Option<f64>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationFilter {
    pub limit: Option<u32>,
    pub session_id: Option<String>,
    pub operation_type: Option<OperationKind>,
}

impl OperationFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub operation_statistics: BTreeMap<String, u64>,
    pub total_operations: u64,
    pub captured_positions: u64,
    pub distinct_captured_positions: u64,
    pub session_statistics: super::SessionStats,
}
