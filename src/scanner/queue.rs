use std::fmt;

use super::position::{is_valid, Delta, Position};
use super::state::{Direction, ScannerState};

/// Why a direction command was refused. State is untouched when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Executing everything already owed plus this step would leave the grid.
    OutOfBounds { target: Position },
    /// The queue already holds as many cells as allowed.
    QueueFull { queued: u32, limit: u32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::OutOfBounds { target } => {
                write!(f, "Movement rejected: target {target} is outside the grid")
            }
            Rejection::QueueFull { queued, limit } => write!(
                f,
                "Too many pending movements ({queued} queued, limit {limit})"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Accepted { pending: Delta },
    Rejected(Rejection),
}

impl QueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, QueueOutcome::Accepted { .. })
    }
}

/// Turns direction commands into pending-delta updates.
#[derive(Debug, Clone, Copy)]
pub struct MovementQueue {
    grid_size: i32,
    max_pending: u32,
}

impl MovementQueue {
    pub fn new(grid_size: i32, max_pending: u32) -> Self {
        Self {
            grid_size,
            max_pending,
        }
    }

    /// Checks both guards without mutating anything.
    pub fn evaluate(&self, state: &ScannerState, direction: Direction) -> Result<Delta, Rejection> {
        let step = direction.unit();
        let owed = state.outstanding().plus(step);

        // Unclamped on purpose: a step into the wall must fail here rather than
        // be silently absorbed by clamping later.
        let target = state.position().offset(owed);
        if !is_valid(target, self.grid_size) {
            return Err(Rejection::OutOfBounds { target });
        }

        let queued = owed.cell_count();
        if queued > self.max_pending {
            return Err(Rejection::QueueFull {
                queued: state.outstanding().cell_count(),
                limit: self.max_pending,
            });
        }

        Ok(state.pending().plus(step))
    }

    pub fn apply(&self, state: &mut ScannerState, direction: Direction) -> QueueOutcome {
        match self.evaluate(state, direction) {
            Ok(_) => {
                state.apply_delta(direction.unit());
                QueueOutcome::Accepted {
                    pending: state.pending(),
                }
            }
            Err(rejection) => QueueOutcome::Rejected(rejection),
        }
    }
}

pub fn has_pending(state: &ScannerState) -> bool {
    state.has_pending()
}
