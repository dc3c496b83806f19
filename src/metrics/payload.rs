//! Wire payload, the durable pending-batch record, and counter delta math.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::errors::{BeaconError, Result};
use crate::logger::dual::ActivityEvent;
use crate::store::backend::Mutation;
use crate::store::codec::{NestedCounter, ScalarCounter, nested_cells};
use crate::store::counter_store::{CounterSet, CounterStore, keys};

// ──────────────────── wire format ────────────────────

/// JSON body POSTed to the collection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
    pub batch_id: String,
    pub app_open_delta: ScalarCounter,
    pub tool_use_delta: NestedCounter,
    pub ad_impression_delta: NestedCounter,
}

impl UploadPayload {
    #[must_use]
    pub fn from_delta(batch_id: &str, delta: CounterSet) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            app_open_delta: delta.app_opens,
            tool_use_delta: delta.tool_use,
            ad_impression_delta: delta.ad_impressions,
        }
    }

    #[must_use]
    pub fn delta(&self) -> CounterSet {
        CounterSet {
            app_opens: self.app_open_delta.clone(),
            tool_use: self.tool_use_delta.clone(),
            ad_impressions: self.ad_impression_delta.clone(),
        }
    }

    /// Number of non-zero cells across the three families.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.app_open_delta.len()
            + nested_cells(&self.tool_use_delta)
            + nested_cells(&self.ad_impression_delta)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ──────────────────── pending batch ────────────────────

/// A cut delta awaiting acknowledgment. Immutable until cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub batch_id: String,
    /// Serialized [`UploadPayload`], sent byte-for-byte on every attempt.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl PendingBatch {
    pub fn new(payload: &UploadPayload, created_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            batch_id: payload.batch_id.clone(),
            payload: payload.to_json()?,
            created_at,
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored record, checking that the embedded payload agrees with it.
    pub fn decode(raw: &str) -> Result<Self> {
        let batch: Self = serde_json::from_str(raw)?;
        let payload = batch.parsed_payload()?;
        if payload.batch_id != batch.batch_id || batch.batch_id.is_empty() {
            return Err(BeaconError::Serialization {
                context: "pending batch",
                details: format!(
                    "record id {:?} does not match payload id {:?}",
                    batch.batch_id, payload.batch_id
                ),
            });
        }
        Ok(batch)
    }

    pub fn parsed_payload(&self) -> Result<UploadPayload> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Read the pending batch without side effects; unreadable records read as `None`.
    pub fn peek(store: &CounterStore) -> Result<Option<Self>> {
        Ok(store
            .get(keys::PENDING_BATCH)?
            .and_then(|raw| Self::decode(&raw).ok()))
    }

    /// Read the pending batch, discarding an unreadable record.
    ///
    /// A discarded batch loses nothing: its increments are still in the raw
    /// counters and the next cut picks them up again.
    pub fn load(store: &CounterStore) -> Result<Option<Self>> {
        let (batch, discarded) = store.update(&[keys::PENDING_BATCH], |view| {
            let Some(raw) = view.get(keys::PENDING_BATCH) else {
                return Ok((Vec::new(), (None, None)));
            };
            match Self::decode(raw) {
                Ok(batch) => Ok((Vec::new(), (Some(batch), None))),
                Err(err) => Ok((
                    vec![Mutation::delete(keys::PENDING_BATCH)],
                    (None, Some(err.to_string())),
                )),
            }
        })?;
        if let Some(details) = discarded {
            store
                .logger()
                .send(ActivityEvent::BatchDiscarded { details });
        }
        Ok(batch)
    }
}

/// `20240101T093000Z-1a2b3c4d`: sortable by cut time, unique per device.
#[must_use]
pub fn new_batch_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::rng().random();
    format!("{}-{suffix:08x}", now.format("%Y%m%dT%H%M%SZ"))
}

// ──────────────────── delta math ────────────────────

/// `raw - sent` per cell, floored at zero, zero cells omitted.
#[must_use]
pub fn delta_between(raw: &CounterSet, sent: &CounterSet) -> CounterSet {
    CounterSet {
        app_opens: scalar_delta(&raw.app_opens, &sent.app_opens),
        tool_use: nested_delta(&raw.tool_use, &sent.tool_use),
        ad_impressions: nested_delta(&raw.ad_impressions, &sent.ad_impressions),
    }
}

/// `sent + delta` per cell.
#[must_use]
pub fn advance(sent: &CounterSet, delta: &CounterSet) -> CounterSet {
    let mut out = sent.clone();
    for (day, n) in &delta.app_opens {
        let cell = out.app_opens.entry(day.clone()).or_insert(0);
        *cell = cell.saturating_add(*n);
    }
    add_nested(&mut out.tool_use, &delta.tool_use);
    add_nested(&mut out.ad_impressions, &delta.ad_impressions);
    out
}

fn scalar_delta(raw: &ScalarCounter, sent: &ScalarCounter) -> ScalarCounter {
    raw.iter()
        .filter_map(|(day, n)| {
            let d = n.saturating_sub(sent.get(day).copied().unwrap_or(0));
            (d > 0).then(|| (day.clone(), d))
        })
        .collect()
}

fn nested_delta(raw: &NestedCounter, sent: &NestedCounter) -> NestedCounter {
    let mut out = NestedCounter::new();
    for (day, cells) in raw {
        let sent_cells = sent.get(day);
        let diff: BTreeMap<String, u64> = cells
            .iter()
            .filter_map(|(subkey, n)| {
                let already = sent_cells.and_then(|s| s.get(subkey)).copied().unwrap_or(0);
                let d = n.saturating_sub(already);
                (d > 0).then(|| (subkey.clone(), d))
            })
            .collect();
        if !diff.is_empty() {
            out.insert(day.clone(), diff);
        }
    }
    out
}

fn add_nested(into: &mut NestedCounter, delta: &NestedCounter) {
    for (day, cells) in delta {
        let day_cells = into.entry(day.clone()).or_default();
        for (subkey, n) in cells {
            let cell = day_cells.entry(subkey.clone()).or_insert(0);
            *cell = cell.saturating_add(*n);
        }
    }
}
