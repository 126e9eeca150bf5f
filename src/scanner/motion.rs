//! Arithmetic for one timed movement step.
//!
//! A step commits a delta and a wall-clock duration. While it runs, elapsed
//! time is converted into whole cells; an interruption keeps those cells
//! (horizontal axis first) and returns the rest to the queue.

use std::time::Duration;

use super::position::{Delta, Position};

/// Resolved plan for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPlan {
    pub from: Position,
    pub target: Position,
    pub committed: Delta,
    pub duration: Duration,
}

impl StepPlan {
    pub fn total_cells(&self) -> u32 {
        self.committed.cell_count()
    }

    /// Whole cells the elapsed time pays for, never more than the step holds.
    pub fn cells_justified(&self, elapsed: Duration) -> u32 {
        cells_justified(elapsed, self.duration, self.total_cells())
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed { position: Position },
    Interrupted { position: Position, returned: Delta },
}

/// `floor(elapsed / (duration / total_cells))`, capped at `total_cells`.
pub fn cells_justified(elapsed: Duration, duration: Duration, total_cells: u32) -> u32 {
    if total_cells == 0 {
        return 0;
    }
    if duration.is_zero() || elapsed >= duration {
        return total_cells;
    }

    let per_cell = duration.as_secs_f64() / f64::from(total_cells);
    let cells = (elapsed.as_secs_f64() / per_cell).floor();
    (cells as u32).min(total_cells)
}

/// Splits `committed` into the part covered by `cells` (horizontal first, then
/// vertical, each bounded by its own axis) and the remainder.
pub fn split_committed(committed: Delta, cells: u32) -> (Delta, Delta) {
    let horizontal_cells = cells.min(committed.horizontal.unsigned_abs());
    let vertical_cells = (cells - horizontal_cells).min(committed.vertical.unsigned_abs());

    let advanced = Delta::new(
        committed.horizontal.signum() * horizontal_cells as i32,
        committed.vertical.signum() * vertical_cells as i32,
    );
    (advanced, committed.minus(advanced))
}
