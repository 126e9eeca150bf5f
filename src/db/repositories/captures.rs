use std::collections::HashSet;

use anyhow::Result;
use rusqlite::{params, params_from_iter, types::Value, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, position_from_columns},
    models::{CaptureEntry, CaptureRecord},
};
use crate::scanner::Position;

pub const DEFAULT_CAPTURE_LIMIT: u32 = 100;

fn row_to_capture(row: &Row) -> Result<CaptureRecord> {
    let captured_at: String = row.get("captured_at")?;

    Ok(CaptureRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        user_id: row.get("user_id")?,
        position: position_from_columns(row.get("position_x")?, row.get("position_y")?)?,
        captured_at: parse_datetime(&captured_at, "captured_at")?,
    })
}

impl Database {
    pub async fn insert_capture(&self, entry: &CaptureEntry) -> Result<i64> {
        let entry = entry.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO captured_positions (session_id, user_id, position_x, position_y, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.session_id,
                    entry.user_id,
                    entry.position.x,
                    entry.position.y,
                    format_datetime(&entry.captured_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn list_captures(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<CaptureRecord>> {
        let mut sql = String::from(
            "SELECT id, session_id, user_id, position_x, position_y, captured_at
             FROM captured_positions
             WHERE user_id = ?",
        );
        let mut values = vec![Value::Text(user_id.to_string())];
        if let Some(session_id) = session_id {
            sql.push_str(" AND session_id = ?");
            values.push(Value::Text(session_id.to_string()));
        }
        sql.push_str(" ORDER BY captured_at DESC, id DESC LIMIT ?");
        values.push(Value::Integer(i64::from(limit)));

        self.execute(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values))?;
            let mut captures = Vec::new();
            while let Some(row) = rows.next()? {
                captures.push(row_to_capture(row)?);
            }
            Ok(captures)
        })
        .await
    }

    pub async fn distinct_captures(&self, user_id: &str) -> Result<HashSet<Position>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT position_x, position_y
                 FROM captured_positions
                 WHERE user_id = ?1",
            )?;
            let mut rows = stmt.query(params![user_id])?;
            let mut positions = HashSet::new();
            while let Some(row) = rows.next()? {
                positions.insert(position_from_columns(row.get(0)?, row.get(1)?)?);
            }
            Ok(positions)
        })
        .await
    }
}
