//! Logging macros gated by a module-level `ENABLE_LOGS` flag.
//!
//! The scanner loop logs on every poll boundary and state transition, which is
//! noisy when debugging a single module. Each module declares the flag and
//! imports the macros from the crate root:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("scanner {} moved to {}", user_id, position);
//! ```

/// Info-level log that is compiled out of the hot path when the calling
/// module sets `ENABLE_LOGS = false`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Warn-level counterpart of [`log_info!`].
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Error-level counterpart of [`log_info!`].
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Debug-level counterpart of [`log_info!`]; used for per-poll tracing.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

/// Wall-clock stamp used on user-facing log messages (`HH:MM:SS.mmm`).
pub fn notice_timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::notice_timestamp;

    #[test]
    fn notice_timestamp_has_millisecond_precision() {
        let stamp = notice_timestamp();
        assert_eq!(stamp.len(), 12);
        assert_eq!(&stamp[2..3], ":");
        assert_eq!(&stamp[8..9], ".");
    }
}
