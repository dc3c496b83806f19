//! Aggregator: the synchronous recording API.
//!
//! Every call resolves today's day key from the injected clock, does nothing
//! unless consent is granted, increments through the counter store, and marks
//! the scheduler dirty.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::errors::Result;
use crate::metrics::consent::ConsentGate;
use crate::store::backend::Mutation;
use crate::store::counter_store::{CounterFamily, CounterStore, keys};
use crate::upload::scheduler::mark_dirty;

/// What a recording call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Counter incremented; carries the cell's new value.
    Recorded(u64),
    ConsentNotGranted,
    BlankIdentifier,
    /// Daily open already credited for today.
    AlreadyCredited,
}

impl RecordOutcome {
    #[must_use]
    pub const fn applied(self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

pub struct Aggregator {
    store: Arc<CounterStore>,
    consent: ConsentGate,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    #[must_use]
    pub fn new(store: Arc<CounterStore>, consent: ConsentGate, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            consent,
            clock,
        }
    }

    pub fn record_app_open(&self) -> Result<RecordOutcome> {
        self.record(CounterFamily::AppOpens, None)
    }

    /// Credit at most one app open per calendar day.
    pub fn record_daily_open_once(&self) -> Result<RecordOutcome> {
        if !self.consent.is_enabled()? {
            return Ok(RecordOutcome::ConsentNotGranted);
        }
        let today = self.clock.today();
        let outcome = self.store.update(
            &[
                keys::CONSENT_STATE,
                keys::LAST_CREDITED_DAY,
                CounterFamily::AppOpens.raw_key(),
            ],
            |view| {
                if !ConsentGate::granted_in(view) {
                    return Ok((Vec::new(), RecordOutcome::ConsentNotGranted));
                }
                if view.get(keys::LAST_CREDITED_DAY) == Some(today.as_str()) {
                    return Ok((Vec::new(), RecordOutcome::AlreadyCredited));
                }
                let (bump, value) =
                    self.store
                        .bump_in_view(view, CounterFamily::AppOpens, &today, None);
                Ok((
                    vec![bump, Mutation::put(keys::LAST_CREDITED_DAY, today.as_str())],
                    RecordOutcome::Recorded(value),
                ))
            },
        )?;
        if outcome.applied() {
            mark_dirty(&self.store)?;
        }
        Ok(outcome)
    }

    pub fn record_tool_use(&self, tool_id: &str) -> Result<RecordOutcome> {
        self.record(CounterFamily::ToolUse, Some(tool_id))
    }

    pub fn record_ad_impression(&self, ad_type: &str) -> Result<RecordOutcome> {
        self.record(CounterFamily::AdImpressions, Some(ad_type))
    }

    fn record(&self, family: CounterFamily, subkey: Option<&str>) -> Result<RecordOutcome> {
        let subkey = subkey.map(str::trim);
        if subkey.is_some_and(str::is_empty) {
            return Ok(RecordOutcome::BlankIdentifier);
        }
        if !self.consent.is_enabled()? {
            return Ok(RecordOutcome::ConsentNotGranted);
        }
        let today = self.clock.today();
        // Consent is re-read under its lock: a revoke that has returned
        // cannot be overtaken by an increment that checked before it.
        let outcome = self
            .store
            .update(&[keys::CONSENT_STATE, family.raw_key()], |view| {
                if !ConsentGate::granted_in(view) {
                    return Ok((Vec::new(), RecordOutcome::ConsentNotGranted));
                }
                let (bump, value) = self.store.bump_in_view(view, family, &today, subkey);
                Ok((vec![bump], RecordOutcome::Recorded(value)))
            })?;
        if outcome.applied() {
            mark_dirty(&self.store)?;
        }
        Ok(outcome)
    }
}
