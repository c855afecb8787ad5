//! Configuration loading for transferd.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `TRANSFERD_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "TRANSFERD_";

/// Application configuration derived from `TRANSFERD_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Settings for the external tool and the job engine around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EngineConfig {
    /// Transfer tool executable (default: `rclone`)
    ///
    /// Environment variable: `TRANSFERD_TOOL_PATH`
    #[serde(default = "default_tool_path")]
    pub tool_path: String,

    /// Remote configuration file handed to the tool as `RCLONE_CONFIG`
    ///
    /// Environment variable: `TRANSFERD_TOOL_CONFIG`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<String>,

    /// Value passed to `--stats` (default: `2s`)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: String,

    /// Archiver used by the zip operation (default: `zip`)
    #[serde(default = "default_archiver_path")]
    pub archiver_path: String,

    /// Supervisor liveness poll interval in milliseconds (default: 200, range: 50-5000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for listing/mkdir/rmdir calls in milliseconds (default: 30000)
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// How long to wait for output readers after the process exits (default: 2000)
    #[serde(default = "default_reader_drain_timeout_ms")]
    pub reader_drain_timeout_ms: u64,

    /// Grace between SIGTERM and SIGKILL when a job is stopped (default: 5000)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Background reconcile tick in milliseconds (default: 1000, range: 100-60000)
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Characters of error text kept per job (default: 10000)
    #[serde(default = "default_error_text_cap")]
    pub error_text_cap: usize,

    /// Directory for per-job `--log-file` sidecars; unset disables them
    ///
    /// Environment variable: `TRANSFERD_LOG_DIR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            tool_config: None,
            stats_interval: default_stats_interval(),
            archiver_path: default_archiver_path(),
            poll_interval_ms: default_poll_interval_ms(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            reader_drain_timeout_ms: default_reader_drain_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            error_text_cap: default_error_text_cap(),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn reader_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_drain_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Path of the per-job `--log-file` sidecar, when sidecars are enabled.
    pub fn log_sidecar(&self, job_id: i64) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("job-{job_id}.log")))
    }

    /// Environment passed to every tool invocation.
    pub fn tool_env(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if let Some(path) = &self.tool_config {
            vars.insert("RCLONE_CONFIG".to_string(), path.clone());
        }
        vars
    }

    /// Validate engine configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_path.trim().is_empty() {
            return Err(ConfigError::MissingToolPath);
        }

        if self.archiver_path.trim().is_empty() {
            return Err(ConfigError::MissingArchiverPath);
        }

        if !(50..=5000).contains(&self.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval {
                value: self.poll_interval_ms,
            });
        }

        if !(100..=600_000).contains(&self.metadata_timeout_ms) {
            return Err(ConfigError::InvalidMetadataTimeout {
                value: self.metadata_timeout_ms,
            });
        }

        if !(100..=60_000).contains(&self.reconcile_interval_ms) {
            return Err(ConfigError::InvalidReconcileInterval {
                value: self.reconcile_interval_ms,
            });
        }

        if !(1000..=1_000_000).contains(&self.error_text_cap) {
            return Err(ConfigError::InvalidErrorTextCap {
                value: self.error_text_cap,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (the remote config path is redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.engine.tool_config.is_some() {
            config.engine.tool_config = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning the first bound that is violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.engine.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://transferd.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_tool_path() -> String {
    "rclone".to_string()
}

fn default_stats_interval() -> String {
    "2s".to_string()
}

fn default_archiver_path() -> String {
    "zip".to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_metadata_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_reader_drain_timeout_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_reconcile_interval_ms() -> u64 {
    1000
}

fn default_error_text_cap() -> usize {
    10_000
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("database url is empty; set TRANSFERD_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("database max connections must be at least 1, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("transfer tool path is empty; set TRANSFERD_TOOL_PATH")]
    MissingToolPath,
    #[error("archiver path is empty; set TRANSFERD_ARCHIVER_PATH")]
    MissingArchiverPath,
    #[error("poll interval must be between 50 and 5000 ms, got {value}")]
    InvalidPollInterval { value: u64 },
    #[error("metadata timeout must be between 100 and 600000 ms, got {value}")]
    InvalidMetadataTimeout { value: u64 },
    #[error("reconcile interval must be between 100 and 60000 ms, got {value}")]
    InvalidReconcileInterval { value: u64 },
    #[error("error text cap must be between 1000 and 1000000 characters, got {value}")]
    InvalidErrorTextCap { value: usize },
}

/// Loads configuration using layered `.env` files and `TRANSFERD_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: dotenv layers first, process environment last.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let engine = EngineConfig {
            tool_path: layered
                .remove("TOOL_PATH")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_tool_path),
            tool_config: layered.remove("TOOL_CONFIG").and_then(non_blank),
            stats_interval: layered
                .remove("STATS_INTERVAL")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_stats_interval),
            archiver_path: layered
                .remove("ARCHIVER_PATH")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_archiver_path),
            poll_interval_ms: layered
                .remove("POLL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_poll_interval_ms),
            metadata_timeout_ms: layered
                .remove("METADATA_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_metadata_timeout_ms),
            reader_drain_timeout_ms: layered
                .remove("READER_DRAIN_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_reader_drain_timeout_ms),
            stop_grace_ms: layered
                .remove("STOP_GRACE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_stop_grace_ms),
            reconcile_interval_ms: layered
                .remove("RECONCILE_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_reconcile_interval_ms),
            error_text_cap: layered
                .remove("ERROR_TEXT_CAP")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_error_text_cap),
            log_dir: layered
                .remove("LOG_DIR")
                .and_then(non_blank)
                .map(PathBuf::from),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            engine,
        };

        config.validate()?;

        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
