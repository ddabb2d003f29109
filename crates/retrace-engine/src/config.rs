//! Engine and application configuration.
//!
//! [`EngineConfig`] holds the engine's construction parameters.
//! [`AppConfig`] is the optional JSON file the CLI reads to choose the
//! log history size and where per-trace log files go.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use retrace_core::Globals;
use retrace_log::LogConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default in-memory log history.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Default bound on a data write.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default directory for per-trace log files.
pub const DEFAULT_LOGS_DIR: &str = "logs";

/// Config file names searched in the working directory, in order.
const LOCAL_CONFIG_FILES: [&str; 2] = ["retrace.json", ".retrace.json"];

/// Engine construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Lines kept in the log ring.
    pub log_capacity: usize,
    /// Bound on writing a data payload to an open connection.
    pub connect_timeout: Duration,
    /// Delay used for messages that carry none.
    pub default_delay: Duration,
    /// Log file; `None` disables persistence only.
    pub log_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_delay: Duration::ZERO,
            log_file: None,
        }
    }
}

impl EngineConfig {
    /// Build from a trace's globals. Zero values keep the defaults.
    pub fn from_globals(globals: &Globals) -> Self {
        Self {
            log_capacity: globals.log_lines.unwrap_or(0),
            connect_timeout: Duration::from_millis(globals.timeout_ms),
            default_delay: Duration::from_millis(globals.delay_ms),
            log_file: None,
        }
        .normalized()
    }

    /// Replace zero capacity and timeout with defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.log_capacity == 0 {
            self.log_capacity = DEFAULT_LOG_CAPACITY;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        self
    }

    /// Log pipeline configuration derived from this config.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            capacity: self.log_capacity,
            file_path: self.log_file.clone(),
            ..LogConfig::default()
        }
    }
}

/// Settings read from the optional config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// In-memory log history size.
    pub log_lines: usize,
    /// Directory that per-trace log files are written to.
    pub logs_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { log_lines: DEFAULT_LOG_CAPACITY, logs_dir: PathBuf::from(DEFAULT_LOGS_DIR) }
    }
}

impl AppConfig {
    /// Load from `path`, or from the first existing default location.
    ///
    /// A missing file yields the defaults. Zero or empty fields are reset
    /// to their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::discover() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let config: Self =
            serde_json::from_str(&json).map_err(|source| ConfigError::Json { path, source })?;
        Ok(config.normalized())
    }

    /// Default locations, in search order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = LOCAL_CONFIG_FILES.iter().map(PathBuf::from).collect();
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".config").join("retrace").join("config.json"));
        }
        paths
    }

    fn discover() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|path| path.is_file())
    }

    #[must_use]
    fn normalized(mut self) -> Self {
        if self.log_lines == 0 {
            self.log_lines = DEFAULT_LOG_CAPACITY;
        }
        if self.logs_dir.as_os_str().is_empty() {
            self.logs_dir = PathBuf::from(DEFAULT_LOGS_DIR);
        }
        self
    }

    /// Log file for a trace: `<logs_dir>/<trace stem>.log`.
    pub fn log_path_for(&self, trace_path: &Path) -> PathBuf {
        let stem = trace_path.file_stem().map_or_else(
            || "replay".to_string(),
            |stem| stem.to_string_lossy().into_owned(),
        );
        self.logs_dir.join(format!("{stem}.log"))
    }
}
