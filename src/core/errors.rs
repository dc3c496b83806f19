//! UMB-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Top-level error type for the usage beacon.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("[UMB-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[UMB-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[UMB-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[UMB-2001] invalid counter key: {details}")]
    InvalidCounterKey { details: String },

    #[error("[UMB-2002] consent not granted")]
    ConsentNotGranted,

    #[error("[UMB-2003] batch {batch_id} is still pending; resume it instead of cutting a new one")]
    BatchOutstanding { batch_id: String },

    #[error("[UMB-2004] store write conflict on {key}")]
    StoreConflict { key: String },

    #[error("[UMB-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[UMB-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[UMB-3001] transport failure: {details}")]
    Transport { details: String },

    #[error("[UMB-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[UMB-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[UMB-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl BeaconError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "UMB-1001",
            Self::MissingConfig { .. } => "UMB-1002",
            Self::ConfigParse { .. } => "UMB-1003",
            Self::InvalidCounterKey { .. } => "UMB-2001",
            Self::ConsentNotGranted => "UMB-2002",
            Self::BatchOutstanding { .. } => "UMB-2003",
            Self::StoreConflict { .. } => "UMB-2004",
            Self::Serialization { .. } => "UMB-2101",
            Self::Sql { .. } => "UMB-2102",
            Self::Transport { .. } => "UMB-3001",
            Self::Io { .. } => "UMB-3002",
            Self::ChannelClosed { .. } => "UMB-3003",
            Self::Runtime { .. } => "UMB-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::StoreConflict { .. }
                | Self::Transport { .. }
                | Self::ChannelClosed { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BeaconError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for BeaconError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
