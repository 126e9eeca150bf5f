//! Admission control, timeouts and retries for persistence calls.
//!
//! One guard is shared by every scanner in the process. It bounds how many
//! store operations may be in flight at once, gives each attempt a deadline,
//! and retries transient failures with exponential backoff.

use std::{future::Future, sync::Arc, time::Duration};

use rand::Rng;
use thiserror::Error;
use tokio::{sync::Semaphore, time};

use crate::db::TransactionExpired;
use crate::settings::DatabaseSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{operation} timed out after {timeout:?} ({attempts} attempts)")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
        attempts: u32,
    },
    #[error("{operation} failed after {attempts} attempts: {source:#}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("{operation} failed: {source:#}")]
    Fatal {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("persistence guard closed")]
    Closed,
}

/// Whether a store error is worth retrying.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<TransactionExpired>().is_some() {
        return true;
    }

    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[derive(Debug)]
pub struct PersistenceGuard {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
}

impl PersistenceGuard {
    pub fn new(
        max_concurrent: usize,
        timeout: Duration,
        max_attempts: u32,
        backoff_base: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            timeout,
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        Self::new(
            settings.max_concurrent_operations,
            settings.transaction_timeout(),
            settings.max_attempts,
            settings.backoff_base(),
        )
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// plus up to half a base of jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.backoff_base.saturating_mul(1u32 << exponent);
        let jitter_ceiling = self.backoff_base.as_millis() as u64 / 2;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        base + Duration::from_millis(jitter)
    }

    /// Runs `op` under an admission permit and a per-attempt deadline.
    /// Transient failures and timeouts are retried; the permit is released
    /// while backing off.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| PersistenceError::Closed)?;
                time::timeout(self.timeout, op()).await
            };

            let failure = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        log_debug!("{operation} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) if !is_transient(&err) => {
                    return Err(PersistenceError::Fatal {
                        operation,
                        source: err,
                    });
                }
                Ok(Err(err)) => {
                    if attempt >= self.max_attempts {
                        return Err(PersistenceError::Transient {
                            operation,
                            attempts: attempt,
                            source: err,
                        });
                    }
                    format!("{err:#}")
                }
                Err(_) => {
                    if attempt >= self.max_attempts {
                        return Err(PersistenceError::Timeout {
                            operation,
                            timeout: self.timeout,
                            attempts: attempt,
                        });
                    }
                    format!("timed out after {:?}", self.timeout)
                }
            };

            let delay = self.backoff_for(attempt);
            log_warn!(
                "{operation} attempt {attempt}/{} failed ({failure}); retrying in {delay:?}",
                self.max_attempts
            );
            time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn busy_error() -> anyhow::Error {
        anyhow::Error::new(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        ))
    }

    fn guard(max_attempts: u32) -> PersistenceGuard {
        PersistenceGuard::new(4, Duration::from_millis(200), max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn classifies_busy_and_expired_as_transient() {
        assert!(is_transient(&busy_error()));
        assert!(is_transient(&anyhow::Error::new(TransactionExpired {
            timeout: Duration::from_millis(5)
        })));
        assert!(!is_transient(&anyhow!("constraint failed")));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let guard = PersistenceGuard::new(1, Duration::from_secs(1), 5, Duration::from_millis(100));
        let first = guard.backoff_for(1);
        let third = guard.backoff_for(3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let guard = guard(3);
        let calls = AtomicU32::new(0);

        let value = guard
            .run("save_state", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(busy_error())
                    } else {
                        Ok(call)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let guard = guard(2);
        let calls = AtomicU32::new(0);

        let err = guard
            .run("save_state", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(busy_error()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Transient { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let guard = guard(5);
        let calls = AtomicU32::new(0);

        let err = guard
            .run("append_capture", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow!("no such table")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_operations_time_out() {
        let guard = PersistenceGuard::new(1, Duration::from_millis(20), 2, Duration::from_millis(1));

        let err = guard
            .run("load_state", || async {
                time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Timeout { attempts: 2, .. }));
        assert_eq!(guard.available_permits(), 1);
    }

    #[tokio::test]
    async fn admission_bounds_concurrent_operations() {
        let guard = Arc::new(PersistenceGuard::new(
            2,
            Duration::from_secs(1),
            1,
            Duration::from_millis(1),
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let guard = Arc::clone(&guard);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                guard
                    .run("save_state", || {
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(guard.available_permits(), 2);
    }
}
