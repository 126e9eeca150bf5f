//! Persistence port consumed by the scanner controller.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use super::position::Position;
use crate::db::{
    models::{CaptureEntry, OperationLogEntry, ScannerRecord},
    Database,
};

#[async_trait]
pub trait ScannerStore: Send + Sync {
    async fn load_state(&self, user_id: &str) -> Result<Option<ScannerRecord>>;

    /// Returns `false` when a newer revision is already stored.
    async fn save_state(&self, record: &ScannerRecord) -> Result<bool>;

    async fn append_operation(&self, entry: &OperationLogEntry) -> Result<()>;

    async fn append_capture(&self, entry: &CaptureEntry) -> Result<()>;

    async fn load_distinct_captures(&self, user_id: &str) -> Result<HashSet<Position>>;

    async fn clear_history(&self, user_id: &str) -> Result<()>;
}

#[async_trait]
impl ScannerStore for Database {
    async fn load_state(&self, user_id: &str) -> Result<Option<ScannerRecord>> {
        self.get_scanner_state(user_id).await
    }

    async fn save_state(&self, record: &ScannerRecord) -> Result<bool> {
        self.upsert_scanner_state(record).await
    }

    async fn append_operation(&self, entry: &OperationLogEntry) -> Result<()> {
        self.insert_operation(entry).await.map(|_| ())
    }

    async fn append_capture(&self, entry: &CaptureEntry) -> Result<()> {
        self.insert_capture(entry).await.map(|_| ())
    }

    async fn load_distinct_captures(&self, user_id: &str) -> Result<HashSet<Position>> {
        self.distinct_captures(user_id).await
    }

    async fn clear_history(&self, user_id: &str) -> Result<()> {
        self.clear_user_history(user_id).await.map(|_| ())
    }
}
