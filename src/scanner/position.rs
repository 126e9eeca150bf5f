use serde::{Deserialize, Serialize};
use std::fmt;

/// A grid cell. Only grid-aligned positions are ever stored or reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: Position) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_within(&self, grid_size: i32) -> bool {
        (0..grid_size).contains(&self.x) && (0..grid_size).contains(&self.y)
    }

    pub fn clamp_to(&self, grid_size: i32) -> Position {
        let max = (grid_size - 1).max(0);
        Position::new(self.x.clamp(0, max), self.y.clamp(0, max))
    }

    pub fn offset(&self, delta: Delta) -> Position {
        Position::new(
            self.x.saturating_add(delta.horizontal),
            self.y.saturating_add(delta.vertical),
        )
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Signed step counts, positive to the right and up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub horizontal: i32,
    pub vertical: i32,
}

impl Delta {
    pub const ZERO: Delta = Delta::new(0, 0);

    pub const fn new(horizontal: i32, vertical: i32) -> Self {
        Self {
            horizontal,
            vertical,
        }
    }

    /// The delta that moves `from` onto `to`.
    pub fn between(from: Position, to: Position) -> Self {
        Self::new(to.x - from.x, to.y - from.y)
    }

    pub fn is_zero(&self) -> bool {
        self.horizontal == 0 && self.vertical == 0
    }

    /// Number of unit cells this delta covers, counting each axis separately.
    pub fn cell_count(&self) -> u32 {
        self.horizontal.unsigned_abs() + self.vertical.unsigned_abs()
    }

    pub fn plus(&self, other: Delta) -> Delta {
        Delta::new(
            self.horizontal.saturating_add(other.horizontal),
            self.vertical.saturating_add(other.vertical),
        )
    }

    pub fn minus(&self, other: Delta) -> Delta {
        Delta::new(
            self.horizontal.saturating_sub(other.horizontal),
            self.vertical.saturating_sub(other.vertical),
        )
    }
}

pub fn distance(a: Position, b: Position) -> f64 {
    a.distance_to(b)
}

pub fn clamp_to_bounds(position: Position, grid_size: i32) -> Position {
    position.clamp_to(grid_size)
}

pub fn is_valid(position: Position, grid_size: i32) -> bool {
    position.is_within(grid_size)
}

/// Where the head ends up if every pending step is executed, clamped to the grid.
pub fn resolve_target(current: Position, pending: Delta, grid_size: i32) -> Position {
    clamp_to_bounds(current.offset(pending), grid_size)
}

/// Seconds needed to travel `distance` cells: `multiplier * sqrt(distance)`.
pub fn movement_duration(distance: f64, speed_multiplier: f64) -> f64 {
    if distance <= 0.0 {
        return 0.0;
    }
    speed_multiplier * distance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        assert_eq!(distance(Position::new(0, 0), Position::new(3, 4)), 5.0);
        assert_eq!(distance(Position::new(2, 2), Position::new(2, 2)), 0.0);
    }

    #[test]
    fn clamp_pulls_each_axis_into_grid() {
        assert_eq!(clamp_to_bounds(Position::new(-3, 14), 11), Position::new(0, 10));
        assert_eq!(clamp_to_bounds(Position::new(4, 6), 11), Position::new(4, 6));
    }

    #[test]
    fn bounds_check_is_half_open() {
        assert!(is_valid(Position::new(0, 10), 11));
        assert!(!is_valid(Position::new(11, 0), 11));
        assert!(!is_valid(Position::new(0, -1), 11));
    }

    #[test]
    fn target_resolution_clamps() {
        let current = Position::new(5, 5);
        assert_eq!(resolve_target(current, Delta::new(2, 1), 11), Position::new(7, 6));
        assert_eq!(resolve_target(current, Delta::new(9, -9), 11), Position::new(10, 0));
    }

    #[test]
    fn duration_scales_with_square_root_of_distance() {
        assert_eq!(movement_duration(0.0, 3.0), 0.0);
        assert_eq!(movement_duration(4.0, 3.0), 6.0);
        let two_cells = movement_duration(distance(Position::new(5, 5), Position::new(7, 5)), 3.0);
        assert!((two_cells - 3.0 * 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn delta_cell_count_sums_axes() {
        assert_eq!(Delta::new(-2, 3).cell_count(), 5);
        assert_eq!(Delta::between(Position::new(5, 5), Position::new(3, 8)), Delta::new(-2, 3));
        assert!(Delta::ZERO.is_zero());
    }
}
