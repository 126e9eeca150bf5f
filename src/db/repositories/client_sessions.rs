use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, to_u64},
    models::{ActiveUser, ClientSession},
};

impl Database {
    pub async fn open_client_session(&self, session: &ClientSession) -> Result<()> {
        let session = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO scanner_sessions (id, user_id, created_at, last_activity, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     last_activity = excluded.last_activity,
                     is_active = excluded.is_active",
                params![
                    session.id,
                    session.user_id,
                    format_datetime(&session.created_at),
                    format_datetime(&session.last_activity),
                    session.is_active,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn touch_client_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE scanner_sessions SET last_activity = ?1 WHERE id = ?2",
                params![format_datetime(&at), session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn close_client_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE scanner_sessions SET is_active = 0, last_activity = ?1 WHERE id = ?2",
                params![format_datetime(&at), session_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Sessions still flagged active belong to a previous process.
    pub async fn mark_all_sessions_inactive(&self) -> Result<usize> {
        self.execute(|conn| {
            let updated = conn.execute(
                "UPDATE scanner_sessions SET is_active = 0 WHERE is_active = 1",
                [],
            )?;
            Ok(updated)
        })
        .await
    }

    /// Users with session activity since `since`, most recent first, along
    /// with their captures over the preceding day.
    pub async fn active_users(&self, since: DateTime<Utc>) -> Result<Vec<ActiveUser>> {
        let since = format_datetime(&since);
        let capture_window = format_datetime(&(Utc::now() - chrono::Duration::hours(24)));
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.user_id,
                        COUNT(*) AS session_count,
                        MAX(s.last_activity) AS last_activity,
                        (SELECT COUNT(*) FROM captured_positions c
                          WHERE c.user_id = s.user_id AND c.captured_at > ?2) AS captured_count,
                        (SELECT MAX(c.captured_at) FROM captured_positions c
                          WHERE c.user_id = s.user_id AND c.captured_at > ?2) AS last_capture
                 FROM scanner_sessions s
                 WHERE s.last_activity > ?1
                 GROUP BY s.user_id
                 ORDER BY last_activity DESC",
            )?;

            let mut rows = stmt.query(params![since, capture_window])?;
            let mut users = Vec::new();
            while let Some(row) = rows.next()? {
                let last_activity: String = row.get("last_activity")?;
                let last_capture: Option<String> = row.get("last_capture")?;
                users.push(ActiveUser {
                    user_id: row.get("user_id")?,
                    session_count: to_u64(row.get("session_count")?, "session_count")?,
                    last_activity: parse_datetime(&last_activity, "last_activity")?,
                    captured_count: to_u64(row.get("captured_count")?, "captured_count")?,
                    last_capture: parse_optional_datetime(last_capture, "last_capture")?,
                });
            }
            Ok(users)
        })
        .await
    }
}
