//! Upload endpoint and API key resolution.
//!
//! Config file and environment only seed the target. Values set at runtime are
//! persisted in the counter store and win, including a stored blank endpoint,
//! which turns uploads off without touching the config file.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::config::UploadConfig;
use crate::core::errors::{BeaconError, Result};
use crate::store::counter_store::{CounterStore, keys};

/// Where and how batches are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub endpoint: String,
    pub api_key: String,
}

impl UploadTarget {
    /// Effective target, or `None` when uploads are disabled.
    pub fn resolve(store: &CounterStore, seed: &UploadConfig) -> Result<Option<Self>> {
        let endpoint = store
            .get(keys::UPLOAD_ENDPOINT)?
            .unwrap_or_else(|| seed.endpoint.clone());
        let api_key = store
            .get(keys::UPLOAD_API_KEY)?
            .unwrap_or_else(|| seed.api_key.clone());
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.trim().to_string(),
        }))
    }

    /// Persist a new endpoint. Only `http://` and `https://` URLs are accepted.
    pub fn set_endpoint(store: &CounterStore, url: &str) -> Result<()> {
        let url = url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(BeaconError::InvalidConfig {
                details: format!("endpoint must be an http(s) URL, got {url:?}"),
            });
        }
        store.set(keys::UPLOAD_ENDPOINT, url)
    }

    pub fn set_api_key(store: &CounterStore, api_key: &str) -> Result<()> {
        store.set(keys::UPLOAD_API_KEY, api_key.trim())
    }

    /// Disable uploads by storing a blank endpoint.
    pub fn disable(store: &CounterStore) -> Result<()> {
        store.set(keys::UPLOAD_ENDPOINT, "")
    }

    /// Forget runtime overrides and fall back to the configured seed.
    pub fn reset(store: &CounterStore) -> Result<()> {
        store.remove(keys::UPLOAD_ENDPOINT)?;
        store.remove(keys::UPLOAD_API_KEY)
    }

    #[must_use]
    pub fn masked_key(&self) -> String {
        mask_secret(&self.api_key)
    }
}

/// Diagnostics view of the target; never carries the full key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSummary {
    pub configured: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

impl TargetSummary {
    #[must_use]
    pub fn of(target: Option<&UploadTarget>) -> Self {
        match target {
            Some(target) => Self {
                configured: true,
                endpoint: Some(target.endpoint.clone()),
                api_key: (!target.api_key.is_empty()).then(|| target.masked_key()),
            },
            None => Self {
                configured: false,
                endpoint: None,
                api_key: None,
            },
        }
    }
}

/// Keep the last four characters; short secrets are fully masked.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}
