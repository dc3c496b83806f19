//! Consent gate: the single switch every recording and upload path checks.
//!
//! State is persisted in the counter store as `consent.state`
//! (`undecided` | `granted` | `denied`) plus `consent.decided`, so the prompt
//! is shown at most once per install.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::core::errors::Result;
use crate::logger::dual::ActivityEvent;
use crate::store::backend::Mutation;
use crate::store::counter_store::{CounterStore, KeyView, keys};

/// Persisted consent decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    Undecided,
    Granted,
    Denied,
}

impl ConsentState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undecided => "undecided",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }

    /// Unknown values read as `Undecided`, which never collects.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("granted") => Self::Granted,
            Some("denied") => Self::Denied,
            _ => Self::Undecided,
        }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-backed consent switch. Cheap to clone.
#[derive(Clone)]
pub struct ConsentGate {
    store: Arc<CounterStore>,
}

impl ConsentGate {
    /// Open the gate, persisting `Undecided` on first use.
    pub fn new(store: Arc<CounterStore>) -> Result<Self> {
        store.update(&[keys::CONSENT_STATE], |view| {
            let mutations = if view.get(keys::CONSENT_STATE).is_none() {
                vec![Mutation::put(
                    keys::CONSENT_STATE,
                    ConsentState::Undecided.as_str(),
                )]
            } else {
                Vec::new()
            };
            Ok((mutations, ()))
        })?;
        Ok(Self { store })
    }

    pub fn state(&self) -> Result<ConsentState> {
        Ok(ConsentState::parse(
            self.store.get(keys::CONSENT_STATE)?.as_deref(),
        ))
    }

    /// True only when consent is explicitly granted.
    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.state()? == ConsentState::Granted)
    }

    /// Same check against an update that holds `consent.state` locked.
    #[must_use]
    pub fn granted_in(view: &KeyView) -> bool {
        ConsentState::parse(view.get(keys::CONSENT_STATE)) == ConsentState::Granted
    }

    /// Grant or revoke collection. Never touches collected counters.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.write(enabled, false)
    }

    pub fn has_decided(&self) -> Result<bool> {
        Ok(self.store.get(keys::CONSENT_DECIDED)?.as_deref() == Some("1"))
    }

    pub fn mark_decided(&self) -> Result<()> {
        self.store.set(keys::CONSENT_DECIDED, "1")
    }

    /// Record the user's answer: sets the state and marks it decided in one commit.
    pub fn set_consent(&self, enabled: bool) -> Result<()> {
        self.write(enabled, true)
    }

    fn write(&self, enabled: bool, decide: bool) -> Result<()> {
        let target = if enabled {
            ConsentState::Granted
        } else {
            ConsentState::Denied
        };
        let previous = self
            .store
            .update(&[keys::CONSENT_STATE, keys::CONSENT_DECIDED], |view| {
                let previous = ConsentState::parse(view.get(keys::CONSENT_STATE));
                let mut mutations = Vec::new();
                if previous != target || view.get(keys::CONSENT_STATE).is_none() {
                    mutations.push(Mutation::put(keys::CONSENT_STATE, target.as_str()));
                }
                if decide && view.get(keys::CONSENT_DECIDED) != Some("1") {
                    mutations.push(Mutation::put(keys::CONSENT_DECIDED, "1"));
                }
                Ok((mutations, previous))
            })?;

        if previous != target {
            self.store.logger().send(ActivityEvent::ConsentChanged {
                from: previous.to_string(),
                to: target.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::dual::ActivityLoggerHandle;
    use crate::store::backend::{MemoryBackend, StorageBackend};

    fn gate() -> (Arc<MemoryBackend>, ConsentGate) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(CounterStore::new(
            backend.clone(),
            ActivityLoggerHandle::noop(),
        ));
        (backend, ConsentGate::new(store).unwrap())
    }

    #[test]
    fn first_construction_persists_undecided() {
        let (backend, gate) = gate();
        assert_eq!(
            backend.get(keys::CONSENT_STATE).unwrap().as_deref(),
            Some("undecided")
        );
        assert_eq!(gate.state().unwrap(), ConsentState::Undecided);
        assert!(!gate.is_enabled().unwrap());
        assert!(!gate.has_decided().unwrap());
    }

    #[test]
    fn construction_keeps_existing_decision() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_raw(keys::CONSENT_STATE, "granted");
        let store = Arc::new(CounterStore::new(backend, ActivityLoggerHandle::noop()));
        let gate = ConsentGate::new(store).unwrap();
        assert!(gate.is_enabled().unwrap());
    }

    #[test]
    fn set_enabled_does_not_mark_decided() {
        let (_backend, gate) = gate();
        gate.set_enabled(true).unwrap();
        assert!(gate.is_enabled().unwrap());
        assert!(!gate.has_decided().unwrap());
        gate.mark_decided().unwrap();
        assert!(gate.has_decided().unwrap());
    }

    #[test]
    fn set_consent_false_is_an_explicit_denial() {
        let (_backend, gate) = gate();
        gate.set_consent(false).unwrap();
        assert_eq!(gate.state().unwrap(), ConsentState::Denied);
        assert!(gate.has_decided().unwrap());
    }

    #[test]
    fn unknown_stored_value_reads_as_undecided() {
        assert_eq!(ConsentState::parse(Some("yes")), ConsentState::Undecided);
        assert_eq!(ConsentState::parse(Some(" granted ")), ConsentState::Granted);
        assert_eq!(ConsentState::parse(None), ConsentState::Undecided);
    }

    #[test]
    fn only_real_changes_are_logged() {
        let backend = Arc::new(MemoryBackend::new());
        let (logger, rx) = ActivityLoggerHandle::capture();
        let store = Arc::new(CounterStore::new(backend, logger));
        let gate = ConsentGate::new(store).unwrap();

        gate.set_consent(true).unwrap();
        gate.set_consent(true).unwrap();
        gate.set_enabled(false).unwrap();

        let events: Vec<ActivityEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ActivityEvent::ConsentChanged {
                    from: "undecided".to_string(),
                    to: "granted".to_string(),
                },
                ActivityEvent::ConsentChanged {
                    from: "granted".to_string(),
                    to: "denied".to_string(),
                },
            ]
        );
    }
}
