use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use super::position::{is_valid, resolve_target, Delta, Position};
use crate::db::models::ScannerRecord;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Ready,
    Moving,
    Focusing,
    Completed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Ready => "ready",
            OperationStatus::Moving => "moving",
            OperationStatus::Focusing => "focusing",
            OperationStatus::Completed => "completed",
        }
    }

    /// Statuses that only make sense while a processing run is alive.
    pub fn is_transient(&self) -> bool {
        !matches!(self, OperationStatus::Ready)
    }
}

impl FromStr for OperationStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "ready" => Ok(OperationStatus::Ready),
            "moving" => Ok(OperationStatus::Moving),
            "focusing" => Ok(OperationStatus::Focusing),
            "completed" => Ok(OperationStatus::Completed),
            other => Err(anyhow!("unknown operation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    pub fn unit(&self) -> Delta {
        match self {
            Direction::Up => Delta::new(0, 1),
            Direction::Down => Delta::new(0, -1),
            Direction::Left => Delta::new(-1, 0),
            Direction::Right => Delta::new(1, 0),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(anyhow!("invalid direction '{other}'")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view handed to clients and HTTP callers.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerSnapshot {
    pub user_id: String,
    pub current_position: Position,
    pub horizontal_movement_pending: i32,
    pub vertical_movement_pending: i32,
    /// Remainder of the step currently executing, zero when idle.
    pub movement_in_flight: Delta,
    pub operation_status: OperationStatus,
    pub operation_start_time: Option<DateTime<Utc>>,
    pub current_movement_duration: Option<f64>,
    pub captured_positions: Vec<Position>,
    pub is_processing: bool,
    pub revision: u64,
    pub last_updated: DateTime<Utc>,
}

/// Per-user scanner state. Every mutating method bumps `revision`, which is
/// what invalidates the cached snapshot and orders durable saves.
#[derive(Debug, Clone)]
pub struct ScannerState {
    user_id: String,
    position: Position,
    pending: Delta,
    committed: Delta,
    status: OperationStatus,
    operation_start_time: Option<DateTime<Utc>>,
    current_movement_duration: Option<f64>,
    captured: HashSet<Position>,
    processing: bool,
    revision: u64,
    updated_at: DateTime<Utc>,
    cached: Option<Arc<ScannerSnapshot>>,
}

impl ScannerState {
    pub fn new(user_id: impl Into<String>, position: Position) -> Self {
        Self {
            user_id: user_id.into(),
            position,
            pending: Delta::ZERO,
            committed: Delta::ZERO,
            status: OperationStatus::Ready,
            operation_start_time: None,
            current_movement_duration: None,
            captured: HashSet::new(),
            processing: false,
            revision: 0,
            updated_at: Utc::now(),
            cached: None,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn pending(&self) -> Delta {
        self.pending
    }

    pub fn committed(&self) -> Delta {
        self.committed
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
        self.updated_at = Utc::now();
        self.cached = None;
    }

    /// Lifts the revision above `floor`, for taking over a stored row that
    /// could not be read at load time.
    pub fn advance_revision_past(&mut self, floor: u64) {
        self.revision = self.revision.max(floor);
        self.touch();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_zero()
    }

    /// Everything still owed to the head: queued steps plus the unexecuted
    /// part of the step in flight.
    pub fn outstanding(&self) -> Delta {
        self.pending.plus(self.committed)
    }

    pub fn apply_delta(&mut self, delta: Delta) {
        self.pending = self.pending.plus(delta);
        self.touch();
    }

    pub fn clear_pending(&mut self) {
        self.pending = Delta::ZERO;
        self.committed = Delta::ZERO;
        self.current_movement_duration = None;
        self.touch();
    }

    pub fn set_processing(&mut self, processing: bool) {
        if self.processing != processing {
            self.processing = processing;
            self.touch();
        }
    }

    /// Commits `step` as the in-flight amount and zeroes the live counters so
    /// commands arriving mid-step accumulate separately.
    pub fn begin_step(&mut self, step: Delta, duration_secs: f64) {
        self.pending = Delta::ZERO;
        self.committed = step;
        self.status = OperationStatus::Moving;
        self.operation_start_time = Some(Utc::now());
        self.current_movement_duration = Some(duration_secs);
        self.touch();
    }

    /// Ends the step early: keeps the `advanced` part and hands `remainder`
    /// back to the live counters.
    pub fn interrupt_step(&mut self, advanced: Delta, remainder: Delta, grid_size: i32) {
        self.position = self.position.offset(advanced).clamp_to(grid_size);
        self.pending = self.pending.plus(remainder);
        self.committed = Delta::ZERO;
        self.current_movement_duration = None;
        self.touch();
    }

    pub fn complete_step(&mut self, target: Position) {
        self.position = target;
        self.committed = Delta::ZERO;
        self.current_movement_duration = None;
        self.touch();
    }

    pub fn begin_focus(&mut self) {
        self.status = OperationStatus::Focusing;
        self.operation_start_time = Some(Utc::now());
        self.current_movement_duration = None;
        self.touch();
    }

    /// Marks the current cell captured. Returns the captured position and
    /// whether it was new to the set.
    pub fn record_capture(&mut self) -> (Position, bool) {
        let position = self.position;
        let inserted = self.captured.insert(position);
        self.status = OperationStatus::Completed;
        self.touch();
        (position, inserted)
    }

    pub fn force_ready(&mut self) {
        self.status = OperationStatus::Ready;
        self.operation_start_time = None;
        self.current_movement_duration = None;
        self.touch();
    }

    pub fn reset(&mut self, default_position: Position) {
        self.position = default_position;
        self.pending = Delta::ZERO;
        self.committed = Delta::ZERO;
        self.status = OperationStatus::Ready;
        self.operation_start_time = None;
        self.current_movement_duration = None;
        self.captured.clear();
        self.processing = false;
        self.touch();
    }

    /// Adopts a durable record, correcting anything that cannot be valid for
    /// the current grid. Returns a description of each correction made.
    pub fn restore(
        &mut self,
        record: &ScannerRecord,
        captures: HashSet<Position>,
        grid_size: i32,
        default_position: Position,
        max_pending: u32,
    ) -> Vec<String> {
        let mut corrections = Vec::new();

        self.position = record.position;
        self.pending = record.pending;
        self.committed = Delta::ZERO;
        self.status = record.status;
        self.operation_start_time = record.operation_start_time;
        self.current_movement_duration = record.current_movement_duration;

        if !is_valid(self.position, grid_size) {
            corrections.push(format!(
                "position {} outside grid, reset to {}",
                self.position, default_position
            ));
            self.position = default_position;
            self.pending = Delta::ZERO;
        }

        if self.pending.cell_count() > max_pending {
            corrections.push(format!(
                "pending {:?} exceeds queue ceiling {max_pending}, cleared",
                self.pending
            ));
            self.pending = Delta::ZERO;
        } else {
            let target = resolve_target(self.position, self.pending, grid_size);
            let reachable = Delta::between(self.position, target);
            if reachable != self.pending {
                corrections.push(format!(
                    "pending {:?} clamped to reachable {:?}",
                    self.pending, reachable
                ));
                self.pending = reachable;
            }
        }

        if self.status.is_transient() {
            corrections.push(format!("stale {} status reset to ready", self.status.as_str()));
            self.status = OperationStatus::Ready;
            self.operation_start_time = None;
            self.current_movement_duration = None;
        }

        let loaded = captures.len();
        self.captured = captures
            .into_iter()
            .filter(|position| is_valid(*position, grid_size))
            .collect();
        if self.captured.len() != loaded {
            corrections.push(format!(
                "dropped {} captured positions outside grid",
                loaded - self.captured.len()
            ));
        }

        self.revision = record.revision;
        self.touch();
        corrections
    }

    /// Durable form. The unexecuted part of an in-flight step is folded back
    /// into the pending counts so a crash mid-step loses no queued motion.
    pub fn to_record(&self) -> ScannerRecord {
        ScannerRecord {
            user_id: self.user_id.clone(),
            position: self.position,
            pending: self.outstanding(),
            status: self.status,
            operation_start_time: self.operation_start_time,
            current_movement_duration: self.current_movement_duration,
            revision: self.revision,
            updated_at: self.updated_at,
        }
    }

    pub fn snapshot(&mut self) -> Arc<ScannerSnapshot> {
        if let Some(cached) = &self.cached {
            return Arc::clone(cached);
        }

        let mut captured_positions: Vec<Position> = self.captured.iter().copied().collect();
        captured_positions.sort();

        let snapshot = Arc::new(ScannerSnapshot {
            user_id: self.user_id.clone(),
            current_position: self.position,
            horizontal_movement_pending: self.pending.horizontal,
            vertical_movement_pending: self.pending.vertical,
            movement_in_flight: self.committed,
            operation_status: self.status,
            operation_start_time: self.operation_start_time,
            current_movement_duration: self.current_movement_duration,
            captured_positions,
            is_processing: self.processing,
            revision: self.revision,
            last_updated: self.updated_at,
        });
        self.cached = Some(Arc::clone(&snapshot));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(position: Position, pending: Delta, status: OperationStatus) -> ScannerRecord {
        ScannerRecord {
            user_id: "abcd".into(),
            position,
            pending,
            status,
            operation_start_time: Some(Utc::now()),
            current_movement_duration: Some(1.5),
            revision: 42,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn direction_parsing_is_case_insensitive() {
        assert_eq!("UP".parse::<Direction>().unwrap(), Direction::Up);
        assert_eq!(" left ".parse::<Direction>().unwrap(), Direction::Left);
        assert!("north".parse::<Direction>().is_err());
    }

    #[test]
    fn snapshot_is_cached_until_mutation() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        let first = state.snapshot();
        let again = state.snapshot();
        assert!(Arc::ptr_eq(&first, &again));

        state.apply_delta(Direction::Right.unit());
        let after = state.snapshot();
        assert!(!Arc::ptr_eq(&first, &after));
        assert_eq!(after.horizontal_movement_pending, 1);
        assert!(after.revision > first.revision);
    }

    #[test]
    fn begin_step_moves_pending_into_committed() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        state.apply_delta(Delta::new(2, 1));
        state.begin_step(Delta::new(2, 1), 3.0);

        assert!(!state.has_pending());
        assert_eq!(state.committed, Delta::new(2, 1));
        assert_eq!(state.status, OperationStatus::Moving);
        assert_eq!(state.to_record().pending, Delta::new(2, 1));
    }

    #[test]
    fn interrupt_returns_remainder_to_pending() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        state.begin_step(Delta::new(3, 0), 3.0);
        state.apply_delta(Direction::Up.unit());
        state.interrupt_step(Delta::new(1, 0), Delta::new(2, 0), 11);

        assert_eq!(state.position, Position::new(6, 5));
        assert_eq!(state.pending, Delta::new(2, 1));
        assert!(state.committed.is_zero());
    }

    #[test]
    fn restore_normalizes_stale_status() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        let mut captures = HashSet::new();
        captures.insert(Position::new(7, 6));
        let corrections = state.restore(
            &record(Position::new(3, 4), Delta::new(1, -2), OperationStatus::Moving),
            captures,
            11,
            Position::new(5, 5),
            100,
        );

        assert_eq!(corrections.len(), 1);
        assert_eq!(state.position, Position::new(3, 4));
        assert_eq!(state.pending, Delta::new(1, -2));
        assert_eq!(state.status, OperationStatus::Ready);
        assert!(state.operation_start_time.is_none());
        assert!(state.captured.contains(&Position::new(7, 6)));
        assert!(state.revision() > 42);
    }

    #[test]
    fn restore_discards_out_of_grid_values() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        let captures = HashSet::from([Position::new(1, 1), Position::new(20, 1)]);
        state.restore(
            &record(Position::new(15, 2), Delta::new(1, 0), OperationStatus::Ready),
            captures,
            11,
            Position::new(5, 5),
            100,
        );

        assert_eq!(state.position, Position::new(5, 5));
        assert!(state.pending.is_zero());
        assert_eq!(state.captured.len(), 1);
    }

    #[test]
    fn restore_clamps_unreachable_pending() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        state.restore(
            &record(Position::new(9, 5), Delta::new(4, 0), OperationStatus::Ready),
            HashSet::new(),
            11,
            Position::new(5, 5),
            100,
        );
        assert_eq!(state.pending, Delta::new(1, 0));
    }

    #[test]
    fn reset_restores_defaults() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        state.apply_delta(Delta::new(2, 0));
        state.captured.insert(Position::new(1, 1));
        state.begin_focus();
        state.reset(Position::new(5, 5));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_position, Position::new(5, 5));
        assert_eq!(snapshot.operation_status, OperationStatus::Ready);
        assert!(snapshot.captured_positions.is_empty());
        assert_eq!(snapshot.horizontal_movement_pending, 0);
    }

    #[test]
    fn advancing_past_a_stored_revision_outranks_it() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        state.apply_delta(Delta::new(1, 0));
        state.advance_revision_past(500);
        assert_eq!(state.revision(), 501);

        state.advance_revision_past(3);
        assert_eq!(state.revision(), 502);
        assert_eq!(state.to_record().revision, 502);
    }
}
