//! Read-only diagnostics snapshot of the beacon's persisted state.
//!
//! Nothing here writes: a malformed pending record is reported as such and
//! left for the delivery path to discard.

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::core::config::UploadConfig;
use crate::core::errors::Result;
use crate::metrics::consent::{ConsentGate, ConsentState};
use crate::metrics::payload::{PendingBatch, UploadPayload, delta_between};
use crate::store::counter_store::{CounterSet, CounterStore, Side, keys};
use crate::upload::scheduler::{is_dirty, last_enqueue_at};
use crate::upload::target::{TargetSummary, UploadTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub cells: usize,
    pub payload: UploadPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub backend: &'static str,
    pub consent: ConsentState,
    pub consent_decided: bool,
    pub raw: CounterSet,
    pub sent: CounterSet,
    /// Raw minus sent: what the next cut would carry.
    pub unsent: CounterSet,
    pub pending: Option<PendingSummary>,
    /// A pending record exists but cannot be decoded.
    pub pending_malformed: bool,
    pub dirty: bool,
    pub last_enqueue_at: Option<DateTime<Utc>>,
    pub last_acknowledged_batch: Option<String>,
    pub target: TargetSummary,
}

impl DiagnosticsSnapshot {
    pub fn capture(
        store: &CounterStore,
        consent: &ConsentGate,
        seed: &UploadConfig,
    ) -> Result<Self> {
        let raw = store.load(Side::Raw)?;
        let sent = store.load(Side::Sent)?;
        let unsent = delta_between(&raw, &sent);

        let pending_record = store.get(keys::PENDING_BATCH)?;
        let pending = PendingBatch::peek(store)?;
        let pending_malformed = pending_record.is_some() && pending.is_none();
        let pending = pending.and_then(|batch| {
            let payload = batch.parsed_payload().ok()?;
            Some(PendingSummary {
                cells: payload.cells(),
                batch_id: batch.batch_id,
                created_at: batch.created_at,
                payload,
            })
        });

        let target = UploadTarget::resolve(store, seed)?;

        Ok(Self {
            backend: store.backend_name(),
            consent: consent.state()?,
            consent_decided: consent.has_decided()?,
            raw,
            sent,
            unsent,
            pending,
            pending_malformed,
            dirty: is_dirty(store)?,
            last_enqueue_at: last_enqueue_at(store)?,
            last_acknowledged_batch: store.get(keys::LAST_ACKED_BATCH)?,
            target: TargetSummary::of(target.as_ref()),
        })
    }
}

/// Snapshot source bound to one store and upload seed.
pub struct Inspector {
    store: Arc<CounterStore>,
    consent: ConsentGate,
    seed: RwLock<UploadConfig>,
}

impl Inspector {
    #[must_use]
    pub fn new(store: Arc<CounterStore>, consent: ConsentGate, seed: UploadConfig) -> Self {
        Self {
            store,
            consent,
            seed: RwLock::new(seed),
        }
    }

    pub fn set_seed(&self, seed: UploadConfig) {
        *self.seed.write() = seed;
    }

    pub fn snapshot(&self) -> Result<DiagnosticsSnapshot> {
        DiagnosticsSnapshot::capture(&self.store, &self.consent, &self.seed.read())
    }
}
