use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{params, params_from_iter, types::Value, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, position_from_columns, to_u64},
    models::{OperationFilter, OperationLogEntry, OperationRecord, SessionStats, UserStats},
};

fn row_to_operation(row: &Row) -> Result<OperationRecord> {
    let timestamp: String = row.get("timestamp")?;
    let operation_type: String = row.get("operation_type")?;

    Ok(OperationRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        user_id: row.get("user_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        operation_type: operation_type.parse()?,
        position: position_from_columns(row.get("position_x")?, row.get("position_y")?)?,
        duration: row.get("duration")?,
        details: row.get("details")?,
    })
}

impl Database {
    pub async fn insert_operation(&self, entry: &OperationLogEntry) -> Result<i64> {
        let entry = entry.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO scanner_operations
                     (session_id, user_id, timestamp, operation_type, position_x, position_y, duration, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.session_id,
                    entry.user_id,
                    format_datetime(&entry.timestamp),
                    entry.kind.as_str(),
                    entry.position.x,
                    entry.position.y,
                    entry.duration,
                    entry.details,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Newest first, optionally narrowed to one session and/or operation type.
    pub async fn list_operations(
        &self,
        user_id: &str,
        filter: &OperationFilter,
    ) -> Result<Vec<OperationRecord>> {
        let mut sql = String::from(
            "SELECT id, session_id, user_id, timestamp, operation_type, position_x, position_y, duration, details
             FROM scanner_operations
             WHERE user_id = ?",
        );
        let mut values = vec![Value::Text(user_id.to_string())];

        if let Some(session_id) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            values.push(Value::Text(session_id.clone()));
        }
        if let Some(kind) = filter.operation_type {
            sql.push_str(" AND operation_type = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        values.push(Value::Integer(i64::from(
            filter.limit.unwrap_or(OperationFilter::DEFAULT_LIMIT),
        )));

        self.execute(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values))?;
            let mut operations = Vec::new();
            while let Some(row) = rows.next()? {
                operations.push(row_to_operation(row)?);
            }
            Ok(operations)
        })
        .await
    }

    /// Deletes the user's operation and capture history in one transaction.
    /// Returns the number of (operations, captures) removed.
    pub async fn clear_user_history(&self, user_id: &str) -> Result<(usize, usize)> {
        let user_id = user_id.to_string();
        self.transact(move |tx| {
            let operations = tx.execute(
                "DELETE FROM scanner_operations WHERE user_id = ?1",
                params![user_id],
            )?;
            let captures = tx.execute(
                "DELETE FROM captured_positions WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok((operations, captures))
        })
        .await
    }

    pub async fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut operation_statistics = BTreeMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT operation_type, COUNT(*) FROM scanner_operations
                     WHERE user_id = ?1
                     GROUP BY operation_type",
                )?;
                let mut rows = stmt.query(params![user_id])?;
                while let Some(row) = rows.next()? {
                    let kind: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    operation_statistics.insert(kind, to_u64(count, "operation count")?);
                }
            }

            let (captured, distinct): (i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        (SELECT COUNT(*) FROM (SELECT DISTINCT position_x, position_y
                                               FROM captured_positions WHERE user_id = ?1))
                 FROM captured_positions
                 WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let (total_sessions, active_sessions, first_session, last_activity): (
                i64,
                Option<i64>,
                Option<String>,
                Option<String>,
            ) = conn.query_row(
                "SELECT COUNT(*), SUM(is_active), MIN(created_at), MAX(last_activity)
                 FROM scanner_sessions
                 WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

            Ok(UserStats {
                total_operations: operation_statistics.values().sum(),
                operation_statistics,
                captured_positions: to_u64(captured, "captured count")?,
                distinct_captured_positions: to_u64(distinct, "distinct captured count")?,
                session_statistics: SessionStats {
                    total_sessions: to_u64(total_sessions, "session count")?,
                    active_sessions: to_u64(active_sessions.unwrap_or(0), "active sessions")?,
                    first_session: parse_optional_datetime(first_session, "created_at")?,
                    last_activity: parse_optional_datetime(last_activity, "last_activity")?,
                },
                user_id,
            })
        })
        .await
    }
}
