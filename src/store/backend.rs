//! Storage backend contract and the in-memory backend.
//!
//! Backends are flat string key/value maps. Every write goes through
//! [`StorageBackend::commit`], which applies a set of mutations as one unit and
//! only if each [`Expectation`] still holds, so callers get compare-and-swap
//! semantics even when several processes share a backing file.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::core::errors::{BeaconError, Result};

/// A single write inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Mutation {
    #[must_use]
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Value a key must still hold at commit time (`None` = absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub key: String,
    pub value: Option<String>,
}

/// Durable key/value storage injected into the counter store.
pub trait StorageBackend: Send + Sync {
    /// Short label for diagnostics.
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Apply `mutations` atomically if every expectation holds; otherwise
    /// nothing is written and [`BeaconError::StoreConflict`] is returned.
    fn commit(&self, expected: &[Expectation], mutations: &[Mutation]) -> Result<()>;

    /// All stored keys, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}

/// Check expectations against a lookup, returning the first mismatching key.
pub(crate) fn first_conflict<F>(expected: &[Expectation], mut lookup: F) -> Result<Option<String>>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    for exp in expected {
        if lookup(&exp.key)? != exp.value {
            return Ok(Some(exp.key.clone()));
        }
    }
    Ok(None)
}

pub(crate) fn apply_to_map(map: &mut BTreeMap<String, String>, mutations: &[Mutation]) {
    for mutation in mutations {
        match mutation {
            Mutation::Put { key, value } => {
                map.insert(key.clone(), value.clone());
            }
            Mutation::Delete { key } => {
                map.remove(key);
            }
        }
    }
}

/// Volatile backend for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a raw value, bypassing codecs (used to plant corrupt data).
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn commit(&self, expected: &[Expectation], mutations: &[Mutation]) -> Result<()> {
        let mut map = self.map.lock();
        if let Some(key) = first_conflict(expected, |k| Ok(map.get(k).cloned()))? {
            return Err(BeaconError::StoreConflict { key });
        }
        apply_to_map(&mut map, mutations);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_applies_puts_and_deletes_together() {
        let backend = MemoryBackend::new();
        backend
            .commit(&[], &[Mutation::put("a", "1"), Mutation::put("b", "2")])
            .unwrap();
        backend
            .commit(&[], &[Mutation::delete("a"), Mutation::put("c", "3")])
            .unwrap();
        assert_eq!(backend.get("a").unwrap(), None);
        assert_eq!(backend.get("b").unwrap().as_deref(), Some("2"));
        assert_eq!(backend.keys().unwrap(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn failed_expectation_writes_nothing() {
        let backend = MemoryBackend::new();
        backend.insert_raw("k", "old");
        let err = backend
            .commit(
                &[Expectation {
                    key: "k".to_string(),
                    value: Some("stale".to_string()),
                }],
                &[Mutation::put("k", "new"), Mutation::put("other", "x")],
            )
            .expect_err("expectation should fail");
        assert_eq!(err.code(), "UMB-2004");
        assert_eq!(backend.get("k").unwrap().as_deref(), Some("old"));
        assert_eq!(backend.get("other").unwrap(), None);
    }

    #[test]
    fn absent_expectation_matches_missing_key() {
        let backend = MemoryBackend::new();
        backend
            .commit(
                &[Expectation {
                    key: "pending".to_string(),
                    value: None,
                }],
                &[Mutation::put("pending", "batch")],
            )
            .unwrap();
        assert!(
            backend
                .commit(
                    &[Expectation {
                        key: "pending".to_string(),
                        value: None,
                    }],
                    &[Mutation::put("pending", "second")],
                )
                .is_err()
        );
    }
}
