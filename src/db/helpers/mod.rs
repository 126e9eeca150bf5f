use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::scanner::Position;

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

/// Fixed-width UTC form so stored timestamps also compare correctly as text.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn position_from_columns(x: i64, y: i64) -> Result<Position> {
    let x = i32::try_from(x).map_err(|_| anyhow!("position_x {x} out of range"))?;
    let y = i32::try_from(y).map_err(|_| anyhow!("position_y {y} out of range"))?;
    Ok(Position::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_datetimes_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(1500);
        assert!(format_datetime(&earlier) < format_datetime(&later));
        assert_eq!(
            parse_datetime(&format_datetime(&later), "ts").unwrap(),
            later
        );
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert!(to_u64(-1, "revision").is_err());
        assert_eq!(to_i64(7).unwrap(), 7);
    }
}
