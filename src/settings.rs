use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

use crate::scanner::Position;

pub const CONFIG_PATH_ENV: &str = "SCANHEAD_CONFIG";

/// Focus durations outside this window are clamped at use.
pub const FOCUS_DURATION_BOUNDS_SECS: (f64, f64) = (0.1, 30.0);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    /// Process-wide cap on persistence calls in flight.
    pub max_concurrent_operations: usize,
    pub transaction_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./scanhead.sqlite3"),
            max_concurrent_operations: 10,
            transaction_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_base_ms: 50,
        }
    }
}

impl DatabaseSettings {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub grid_size: i32,
    pub default_position_x: i32,
    pub default_position_y: i32,
    pub movement_speed_multiplier: f64,
    pub focus_duration_secs: f64,
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub max_pending_movements: u32,
    pub max_iterations: u32,
    pub processing_timeout_secs: f64,
    pub max_move_duration_secs: f64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            grid_size: 11,
            default_position_x: 5,
            default_position_y: 5,
            movement_speed_multiplier: 3.0,
            focus_duration_secs: 2.0,
            settle_delay_ms: 500,
            poll_interval_ms: 100,
            max_pending_movements: 10_000,
            max_iterations: 100,
            processing_timeout_secs: 300.0,
            max_move_duration_secs: 60.0,
        }
    }
}

impl ScannerSettings {
    pub fn default_position(&self) -> Position {
        Position::new(self.default_position_x, self.default_position_y)
    }

    pub fn focus_duration(&self) -> Duration {
        let (min, max) = FOCUS_DURATION_BOUNDS_SECS;
        Duration::from_secs_f64(self.focus_duration_secs.clamp(min, max))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.processing_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub scanner: ScannerSettings,
    pub log_level: Option<String>,
}

impl Settings {
    /// Loads settings from the file named by `SCANHEAD_CONFIG` (if any), applies
    /// `SCANHEAD_*` environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let mut settings = match env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: PathBuf) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Applies overrides from a key lookup. Tests pass a map instead of the
    /// process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("invalid value for {key}: {err}"))
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse($key, raw)?;
                }
            };
        }

        override_field!("SCANHEAD_HOST", self.server.host);
        override_field!("SCANHEAD_PORT", self.server.port);
        override_field!("SCANHEAD_DATABASE_PATH", self.database.path);
        override_field!(
            "SCANHEAD_DB_MAX_CONCURRENT",
            self.database.max_concurrent_operations
        );
        override_field!(
            "SCANHEAD_DB_TRANSACTION_TIMEOUT_MS",
            self.database.transaction_timeout_ms
        );
        override_field!("SCANHEAD_DB_MAX_ATTEMPTS", self.database.max_attempts);
        override_field!("SCANHEAD_GRID_SIZE", self.scanner.grid_size);
        override_field!("SCANHEAD_DEFAULT_X", self.scanner.default_position_x);
        override_field!("SCANHEAD_DEFAULT_Y", self.scanner.default_position_y);
        override_field!(
            "SCANHEAD_SPEED_MULTIPLIER",
            self.scanner.movement_speed_multiplier
        );
        override_field!("SCANHEAD_FOCUS_DURATION", self.scanner.focus_duration_secs);
        override_field!(
            "SCANHEAD_MAX_PENDING_MOVEMENTS",
            self.scanner.max_pending_movements
        );

        if let Some(level) = lookup("SCANHEAD_LOG_LEVEL") {
            self.log_level = Some(level);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let scanner = &self.scanner;
        if scanner.grid_size < 1 {
            bail!("grid_size must be at least 1 (got {})", scanner.grid_size);
        }
        if !scanner.default_position().is_within(scanner.grid_size) {
            bail!(
                "default position {} must lie inside a {}x{} grid",
                scanner.default_position(),
                scanner.grid_size,
                scanner.grid_size
            );
        }
        // Duration::from_secs_f64 panics on non-finite input.
        let positive = |value: f64| value.is_finite() && value > 0.0;
        if !positive(scanner.movement_speed_multiplier) {
            bail!("movement_speed_multiplier must be positive and finite");
        }
        if !positive(scanner.focus_duration_secs) {
            bail!("focus_duration_secs must be positive and finite");
        }
        if !positive(scanner.max_move_duration_secs) || !positive(scanner.processing_timeout_secs) {
            bail!("movement time limits must be positive and finite");
        }
        if scanner.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be non-zero");
        }
        if scanner.max_pending_movements == 0 || scanner.max_iterations == 0 {
            bail!("movement queue limits must be non-zero");
        }

        let database = &self.database;
        if database.max_concurrent_operations == 0 {
            bail!("database.max_concurrent_operations must be non-zero");
        }
        if database.max_attempts == 0 {
            bail!("database.max_attempts must be non-zero");
        }
        if database.transaction_timeout_ms == 0 {
            bail!("database.transaction_timeout_ms must be non-zero");
        }
        Ok(())
    }
}
