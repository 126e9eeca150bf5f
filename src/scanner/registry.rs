use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;
use tokio::sync::OnceCell;

use super::{controller::ScannerController, guard::PersistenceGuard, store::ScannerStore};
use crate::settings::ScannerSettings;

const ENABLE_LOGS: bool = true;

use crate::log_info;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid user id '{0}': expected 4-6 alphanumeric characters")]
pub struct InvalidUserId(pub String);

pub fn validate_user_id(user_id: &str) -> bool {
    (4..=6).contains(&user_id.len()) && user_id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Process-wide map of user id to scanner. Entries are created lazily and
/// initialised exactly once; they live until the process exits.
pub struct ScannerRegistry {
    entries: Mutex<HashMap<String, Arc<OnceCell<ScannerController>>>>,
    settings: ScannerSettings,
    store: Arc<dyn ScannerStore>,
    guard: Arc<PersistenceGuard>,
}

impl ScannerRegistry {
    pub fn new(
        settings: ScannerSettings,
        store: Arc<dyn ScannerStore>,
        guard: Arc<PersistenceGuard>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            settings,
            store,
            guard,
        }
    }

    /// Returns the user's scanner, loading it on first access. Concurrent first
    /// accesses share one initialisation.
    pub async fn get_or_create(&self, user_id: &str) -> Result<ScannerController, InvalidUserId> {
        if !validate_user_id(user_id) {
            return Err(InvalidUserId(user_id.to_string()));
        }

        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(user_id.to_string()).or_default())
        };

        let controller = cell
            .get_or_init(|| async {
                let controller = ScannerController::new(
                    user_id,
                    self.settings.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.guard),
                );
                controller.initialize().await;
                log_info!("Scanner {user_id} registered");
                controller
            })
            .await;
        Ok(controller.clone())
    }

    /// Already-initialised scanner, if any.
    pub fn get(&self, user_id: &str) -> Option<ScannerController> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(user_id).and_then(|cell| cell.get().cloned())
    }

    pub fn user_ids(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CaptureEntry, OperationLogEntry, ScannerRecord};
    use crate::scanner::{Direction, Position};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingStore {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ScannerStore for CountingStore {
        async fn load_state(&self, _user_id: &str) -> Result<Option<ScannerRecord>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(None)
        }

        async fn save_state(&self, _record: &ScannerRecord) -> Result<bool> {
            Ok(true)
        }

        async fn append_operation(&self, _entry: &OperationLogEntry) -> Result<()> {
            Ok(())
        }

        async fn append_capture(&self, _entry: &CaptureEntry) -> Result<()> {
            Ok(())
        }

        async fn load_distinct_captures(&self, _user_id: &str) -> Result<HashSet<Position>> {
            Ok(HashSet::new())
        }

        async fn clear_history(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn registry(store: Arc<CountingStore>) -> Arc<ScannerRegistry> {
        let guard = Arc::new(PersistenceGuard::new(
            4,
            Duration::from_secs(1),
            1,
            Duration::from_millis(1),
        ));
        let settings = ScannerSettings {
            movement_speed_multiplier: 5.0,
            ..ScannerSettings::default()
        };
        Arc::new(ScannerRegistry::new(settings, store, guard))
    }

    #[test]
    fn user_ids_must_be_short_and_alphanumeric() {
        assert!(validate_user_id("abcd"));
        assert!(validate_user_id("A1b2C3"));
        assert!(!validate_user_id("abc"));
        assert!(!validate_user_id("abcdefg"));
        assert!(!validate_user_id("ab-cd"));
        assert!(!validate_user_id("ab cd"));
    }

    #[tokio::test]
    async fn invalid_ids_never_reach_the_map() {
        let registry = registry(Arc::new(CountingStore::default()));
        let Err(err) = registry.get_or_create("../etc").await else {
            panic!("invalid id was accepted");
        };
        assert_eq!(err, InvalidUserId("../etc".into()));
        assert!(registry.user_ids().is_empty());
    }

    #[tokio::test]
    async fn concurrent_first_access_initialises_once() {
        let store = Arc::new(CountingStore::default());
        let registry = registry(Arc::clone(&store));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.get_or_create("abcd").await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.user_ids(), vec!["abcd".to_string()]);
    }

    #[tokio::test]
    async fn handles_share_one_scanner_per_user() {
        let registry = registry(Arc::new(CountingStore::default()));
        let first = registry.get_or_create("abcd").await.unwrap();
        let other_user = registry.get_or_create("wxyz").await.unwrap();

        first.queue_movement(Direction::Up, None).await.unwrap();

        let again = registry.get("abcd").unwrap();
        let snapshot = again.get_state_snapshot().await;
        assert_eq!(
            snapshot.vertical_movement_pending + snapshot.movement_in_flight.vertical,
            1
        );
        assert!(snapshot.is_processing);
        assert!(!other_user.get_state_snapshot().await.is_processing);
        assert!(registry.get("none1").is_none());
    }
}
