//! Delta batcher: cuts `raw - sent` into a durable pending batch.
//!
//! This is the only writer of `batch.pending`. The cut locks the pending key
//! together with both counter copies, so the batch reflects a single instant
//! and no second batch can be cut while one is outstanding.

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::errors::{BeaconError, Result};
use crate::logger::dual::ActivityEvent;
use crate::metrics::consent::ConsentGate;
use crate::metrics::payload::{PendingBatch, UploadPayload, delta_between, new_batch_id};
use crate::store::backend::Mutation;
use crate::store::counter_store::{CounterStore, Side, keys};

pub struct Batcher {
    store: Arc<CounterStore>,
    consent: ConsentGate,
}

impl Batcher {
    #[must_use]
    pub fn new(store: Arc<CounterStore>, consent: ConsentGate) -> Self {
        Self { store, consent }
    }

    /// Cut a new batch from everything recorded but not yet acknowledged.
    ///
    /// Returns `Ok(None)` and writes nothing when there is nothing to send.
    /// Fails with `ConsentNotGranted` without consent and with
    /// `BatchOutstanding` while an earlier batch is still pending.
    pub fn compute_delta(&self, now: DateTime<Utc>) -> Result<Option<PendingBatch>> {
        if !self.consent.is_enabled()? {
            return Err(BeaconError::ConsentNotGranted);
        }

        let mut locked = vec![keys::PENDING_BATCH];
        locked.extend(Side::Raw.keys());
        locked.extend(Side::Sent.keys());

        let mut discarded = None;
        let batch = self.store.update(&locked, |view| {
            let mut mutations = Vec::new();
            discarded = None;
            if let Some(raw) = view.get(keys::PENDING_BATCH) {
                match PendingBatch::decode(raw) {
                    Ok(existing) => {
                        return Err(BeaconError::BatchOutstanding {
                            batch_id: existing.batch_id,
                        });
                    }
                    Err(err) => {
                        discarded = Some(err.to_string());
                        mutations.push(Mutation::delete(keys::PENDING_BATCH));
                    }
                }
            }

            let raw = self.store.counter_set(view, Side::Raw);
            let sent = self.store.counter_set(view, Side::Sent);
            let delta = delta_between(&raw, &sent);
            if delta.is_empty() {
                return Ok((mutations, None));
            }

            let payload = UploadPayload::from_delta(&new_batch_id(now), delta);
            let batch = PendingBatch::new(&payload, now)?;
            mutations.retain(|m| m.key() != keys::PENDING_BATCH);
            mutations.push(Mutation::put(keys::PENDING_BATCH, batch.encode()?));
            Ok((mutations, Some((batch, payload.cells()))))
        })?;

        if let Some(details) = discarded {
            self.store
                .logger()
                .send(ActivityEvent::BatchDiscarded { details });
        }

        Ok(batch.map(|(batch, cells)| {
            self.store.logger().send(ActivityEvent::BatchCut {
                batch_id: batch.batch_id.clone(),
                cells,
            });
            batch
        }))
    }
}
