//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{BeaconError, Result};

/// Full beacon configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub upload: UploadConfig,
    pub scheduler: SchedulerConfig,
    pub recording: RecordingConfig,
    pub store: StoreConfig,
    pub paths: PathsConfig,
}

/// Upload target seed and delivery retry policy.
///
/// `endpoint` and `api_key` only seed the upload target; values written at
/// runtime into the counter store take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: String,
    pub api_key: String,
    pub min_interval_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
}

/// When opportunistic upload checks are allowed to hand off work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the daemon's background check.
    pub check_interval_secs: u64,
    /// Only upload on unmetered networks.
    pub require_unmetered: bool,
    /// Hold uploads while the battery is low and not charging.
    pub skip_on_low_battery: bool,
}

/// Background recording queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecordingConfig {
    pub queue_capacity: usize,
    pub workers: usize,
}

/// Which storage backend the counter store uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Sqlite,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
}

/// Filesystem paths used by the beacon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub store_db: PathBuf,
    pub store_json: PathBuf,
    pub activity_jsonl: PathBuf,
    pub activity_db: PathBuf,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            min_interval_secs: 15 * 60,
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            timeout_secs: 15,
        }
    }
}

impl UploadConfig {
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5 * 60,
            require_unmetered: false,
            skip_on_low_battery: true,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 3,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "sqlite") {
                StoreBackendKind::Sqlite
            } else {
                StoreBackendKind::Json
            },
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[UMB-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir
            .join(".config")
            .join("usage-beacon")
            .join("config.toml");
        let data = home_dir.join(".local").join("share").join("usage-beacon");
        Self {
            config_file: cfg,
            store_db: data.join("counters.sqlite3"),
            store_json: data.join("counters.json"),
            activity_jsonl: data.join("activity.jsonl"),
            activity_db: data.join("activity.sqlite3"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| BeaconError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(BeaconError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for activity logging.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    /// The API key is excluded.
    pub fn stable_hash(&self) -> Result<String> {
        let mut redacted = self.clone();
        redacted.upload.api_key.clear();
        let canonical = serde_json::to_string(&redacted)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // upload
        if let Some(raw) = lookup("UMB_UPLOAD_ENDPOINT") {
            self.upload.endpoint = raw;
        }
        if let Some(raw) = lookup("UMB_UPLOAD_API_KEY") {
            self.upload.api_key = raw;
        }
        if let Some(raw) = lookup("UMB_UPLOAD_MIN_INTERVAL_SECS") {
            self.upload.min_interval_secs = parse_env("UMB_UPLOAD_MIN_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("UMB_UPLOAD_MAX_ATTEMPTS") {
            self.upload.max_attempts = parse_env("UMB_UPLOAD_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("UMB_UPLOAD_INITIAL_BACKOFF_MS") {
            self.upload.initial_backoff_ms = parse_env("UMB_UPLOAD_INITIAL_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = lookup("UMB_UPLOAD_MAX_BACKOFF_MS") {
            self.upload.max_backoff_ms = parse_env("UMB_UPLOAD_MAX_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = lookup("UMB_UPLOAD_TIMEOUT_SECS") {
            self.upload.timeout_secs = parse_env("UMB_UPLOAD_TIMEOUT_SECS", &raw)?;
        }
        // scheduler
        if let Some(raw) = lookup("UMB_SCHEDULER_CHECK_INTERVAL_SECS") {
            self.scheduler.check_interval_secs =
                parse_env("UMB_SCHEDULER_CHECK_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("UMB_SCHEDULER_REQUIRE_UNMETERED") {
            self.scheduler.require_unmetered = parse_env("UMB_SCHEDULER_REQUIRE_UNMETERED", &raw)?;
        }
        if let Some(raw) = lookup("UMB_SCHEDULER_SKIP_ON_LOW_BATTERY") {
            self.scheduler.skip_on_low_battery =
                parse_env("UMB_SCHEDULER_SKIP_ON_LOW_BATTERY", &raw)?;
        }
        // recording
        if let Some(raw) = lookup("UMB_RECORDING_QUEUE_CAPACITY") {
            self.recording.queue_capacity = parse_env("UMB_RECORDING_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("UMB_RECORDING_WORKERS") {
            self.recording.workers = parse_env("UMB_RECORDING_WORKERS", &raw)?;
        }
        // store + paths
        if let Some(raw) = lookup("UMB_STORE_BACKEND") {
            self.store.backend = match raw.trim().to_ascii_lowercase().as_str() {
                "sqlite" => StoreBackendKind::Sqlite,
                "json" => StoreBackendKind::Json,
                other => {
                    return Err(BeaconError::ConfigParse {
                        context: "env",
                        details: format!("UMB_STORE_BACKEND={other:?}: expected sqlite or json"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("UMB_DATA_DIR") {
            let data = PathBuf::from(raw);
            self.paths.store_db = data.join("counters.sqlite3");
            self.paths.store_json = data.join("counters.json");
            self.paths.activity_jsonl = data.join("activity.jsonl");
            self.paths.activity_db = data.join("activity.sqlite3");
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.upload.endpoint = self.upload.endpoint.trim().to_string();
        self.upload.api_key = self.upload.api_key.trim().to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.upload.max_attempts == 0 {
            return Err(BeaconError::InvalidConfig {
                details: "upload.max_attempts must be >= 1".to_string(),
            });
        }
        if self.upload.timeout_secs == 0 {
            return Err(BeaconError::InvalidConfig {
                details: "upload.timeout_secs must be > 0".to_string(),
            });
        }
        if self.upload.initial_backoff_ms > self.upload.max_backoff_ms {
            return Err(BeaconError::InvalidConfig {
                details: format!(
                    "upload.initial_backoff_ms ({}) must be <= upload.max_backoff_ms ({})",
                    self.upload.initial_backoff_ms, self.upload.max_backoff_ms
                ),
            });
        }
        if !self.upload.endpoint.is_empty()
            && !(self.upload.endpoint.starts_with("https://")
                || self.upload.endpoint.starts_with("http://"))
        {
            return Err(BeaconError::InvalidConfig {
                details: format!(
                    "upload.endpoint must be an http(s) URL, got {:?}",
                    self.upload.endpoint
                ),
            });
        }
        if self.scheduler.check_interval_secs == 0 {
            return Err(BeaconError::InvalidConfig {
                details: "scheduler.check_interval_secs must be > 0".to_string(),
            });
        }
        if self.recording.queue_capacity == 0 || self.recording.workers == 0 {
            return Err(BeaconError::InvalidConfig {
                details: "recording.queue_capacity and recording.workers must be > 0".to_string(),
            });
        }
        #[cfg(not(feature = "sqlite"))]
        if self.store.backend == StoreBackendKind::Sqlite {
            return Err(BeaconError::InvalidConfig {
                details: "store.backend = \"sqlite\" requires the sqlite feature".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| BeaconError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
