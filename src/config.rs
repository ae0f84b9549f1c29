//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. `pharmatrail.toml` next to the executable
//! 2. `~/.config/pharmatrail/config.toml` (`%LOCALAPPDATA%\PharmaTrail\config.toml` on Windows)
//! 3. Environment variable overrides (e.g. `PHARMATRAIL_DB`)
//!
//! CLI arguments always take precedence over config file values.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub paths: PathsConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a writer waits on a locked database before the operation
    /// fails with a timeout, in milliseconds.
    pub busy_timeout_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file for SIEM integration.
    /// Empty string means no file logging.
    pub json_log_file: String,
    /// Whether to also output JSON to stdout (for container/SIEM pipelines).
    pub json_stdout: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("pharmatrail.db"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl TrailConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: TrailConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    /// Load config using the standard search order:
    /// 1. Explicit path (if given)
    /// 2. `pharmatrail.toml` next to the running binary
    /// 3. Platform-standard config directory
    /// 4. Built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        // Next to executable.
        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("pharmatrail.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        // Platform-standard config directory.
        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("PharmaTrail").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("pharmatrail")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("PHARMATRAIL_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("PHARMATRAIL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(ms) = std::env::var("PHARMATRAIL_BUSY_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse::<u32>() {
                self.store.busy_timeout_ms = parsed;
            }
        }
    }
}
