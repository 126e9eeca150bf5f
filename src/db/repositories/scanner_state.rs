use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, position_from_columns, to_i64, to_u64},
    models::ScannerRecord,
};
use crate::scanner::Delta;

fn row_to_record(row: &Row) -> Result<ScannerRecord> {
    let x: i64 = row.get("current_position_x")?;
    let y: i64 = row.get("current_position_y")?;
    let status: String = row.get("operation_status")?;
    let started: Option<String> = row.get("operation_start_time")?;
    let revision: i64 = row.get("revision")?;
    let updated: String = row.get("last_updated")?;

    Ok(ScannerRecord {
        user_id: row.get("user_id")?,
        position: position_from_columns(x, y)?,
        pending: Delta::new(
            row.get("horizontal_movement_pending")?,
            row.get("vertical_movement_pending")?,
        ),
        status: status.parse()?,
        operation_start_time: parse_optional_datetime(started, "operation_start_time")?,
        current_movement_duration: row.get("current_movement_duration")?,
        revision: to_u64(revision, "revision")?,
        updated_at: parse_datetime(&updated, "last_updated")?,
    })
}

impl Database {
    pub async fn get_scanner_state(&self, user_id: &str) -> Result<Option<ScannerRecord>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, current_position_x, current_position_y,
                        horizontal_movement_pending, vertical_movement_pending,
                        operation_status, operation_start_time, current_movement_duration,
                        revision, last_updated
                 FROM scanner_state
                 WHERE user_id = ?1",
            )?;

            let record = stmt
                .query_row(params![user_id], |row| Ok(row_to_record(row)))
                .optional()?
                .transpose()?;
            Ok(record)
        })
        .await
    }

    /// Writes `record` unless the stored row already carries a newer revision.
    /// Returns whether the row was written.
    pub async fn upsert_scanner_state(&self, record: &ScannerRecord) -> Result<bool> {
        let record = record.clone();
        self.transact(move |tx| {
            let changed = tx.execute(
                "INSERT INTO scanner_state (
                     user_id, current_position_x, current_position_y,
                     horizontal_movement_pending, vertical_movement_pending,
                     operation_status, operation_start_time, current_movement_duration,
                     revision, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(user_id) DO UPDATE SET
                     current_position_x = excluded.current_position_x,
                     current_position_y = excluded.current_position_y,
                     horizontal_movement_pending = excluded.horizontal_movement_pending,
                     vertical_movement_pending = excluded.vertical_movement_pending,
                     operation_status = excluded.operation_status,
                     operation_start_time = excluded.operation_start_time,
                     current_movement_duration = excluded.current_movement_duration,
                     revision = excluded.revision,
                     last_updated = excluded.last_updated
                 WHERE excluded.revision >= scanner_state.revision",
                params![
                    record.user_id,
                    record.position.x,
                    record.position.y,
                    record.pending.horizontal,
                    record.pending.vertical,
                    record.status.as_str(),
                    record.operation_start_time.as_ref().map(format_datetime),
                    record.current_movement_duration,
                    to_i64(record.revision)?,
                    format_datetime(&record.updated_at),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}
