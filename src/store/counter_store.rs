//! Durable counter store: the only component that touches a storage backend.
//!
//! Reads are lock-free against committed values. Writes go through
//! [`CounterStore::update`], which takes per-key locks (sorted, so concurrent
//! multi-key updates cannot deadlock), hands the closure a consistent view of
//! those keys, and commits the resulting mutations as one unit with the view as
//! compare-and-swap expectations. Unrelated keys never wait on each other.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::core::clock::DayKey;
use crate::core::errors::{BeaconError, Result};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::store::backend::{Expectation, Mutation, StorageBackend};
use crate::store::codec::{
    DecodeReport, NestedCounter, ScalarCounter, decode_nested, decode_scalar, encode_nested,
    encode_scalar,
};

/// Cross-process conflicts are retried this many times before giving up.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Logical storage keys.
pub mod keys {
    pub const CONSENT_STATE: &str = "consent.state";
    pub const CONSENT_DECIDED: &str = "consent.decided";
    pub const LAST_CREDITED_DAY: &str = "aggregator.last_credited_day";
    pub const PENDING_BATCH: &str = "batch.pending";
    pub const LAST_ACKED_BATCH: &str = "sent.last_batch_id";
    pub const DIRTY: &str = "scheduler.dirty";
    pub const LAST_ENQUEUE_AT: &str = "scheduler.last_enqueue_at";
    pub const UPLOAD_ENDPOINT: &str = "upload.endpoint";
    pub const UPLOAD_API_KEY: &str = "upload.api_key";
}

/// The three fixed counter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterFamily {
    AppOpens,
    ToolUse,
    AdImpressions,
}

impl CounterFamily {
    pub const ALL: [Self; 3] = [Self::AppOpens, Self::ToolUse, Self::AdImpressions];

    #[must_use]
    pub const fn raw_key(self) -> &'static str {
        match self {
            Self::AppOpens => "counters.app_opens",
            Self::ToolUse => "counters.tool_use",
            Self::AdImpressions => "counters.ad_impressions",
        }
    }

    #[must_use]
    pub const fn sent_key(self) -> &'static str {
        match self {
            Self::AppOpens => "sent.app_opens",
            Self::ToolUse => "sent.tool_use",
            Self::AdImpressions => "sent.ad_impressions",
        }
    }

    #[must_use]
    pub const fn is_nested(self) -> bool {
        !matches!(self, Self::AppOpens)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::AppOpens => "app_opens",
            Self::ToolUse => "tool_use",
            Self::AdImpressions => "ad_impressions",
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::AppOpens => 0,
            Self::ToolUse => 1,
            Self::AdImpressions => 2,
        }
    }
}

/// Which copy of the counters to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Raw,
    Sent,
}

impl Side {
    #[must_use]
    pub const fn key(self, family: CounterFamily) -> &'static str {
        match self {
            Self::Raw => family.raw_key(),
            Self::Sent => family.sent_key(),
        }
    }

    /// Storage keys for all three families on this side.
    #[must_use]
    pub fn keys(self) -> [&'static str; 3] {
        CounterFamily::ALL.map(|family| self.key(family))
    }
}

/// One full copy of the three counter families.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSet {
    pub app_opens: ScalarCounter,
    pub tool_use: NestedCounter,
    pub ad_impressions: NestedCounter,
}

impl CounterSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.app_opens.is_empty() && self.tool_use.is_empty() && self.ad_impressions.is_empty()
    }

    /// Mutations that persist this set on `side`.
    #[must_use]
    pub fn to_mutations(&self, side: Side) -> Vec<Mutation> {
        vec![
            Mutation::put(side.key(CounterFamily::AppOpens), encode_scalar(&self.app_opens)),
            Mutation::put(side.key(CounterFamily::ToolUse), encode_nested(&self.tool_use)),
            Mutation::put(
                side.key(CounterFamily::AdImpressions),
                encode_nested(&self.ad_impressions),
            ),
        ]
    }
}

/// Consistent values of the locked keys inside an [`CounterStore::update`].
#[derive(Debug, Clone, Default)]
pub struct KeyView {
    values: BTreeMap<String, Option<String>>,
}

impl KeyView {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_deref())
    }

    fn expectations(&self) -> Vec<Expectation> {
        self.values
            .iter()
            .map(|(key, value)| Expectation {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

/// Durable store of day-keyed counters and small settings.
pub struct CounterStore {
    backend: Arc<dyn StorageBackend>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    logger: ActivityLoggerHandle,
}

impl CounterStore {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, logger: ActivityLoggerHandle) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            logger,
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn logger(&self) -> &ActivityLoggerHandle {
        &self.logger
    }

    // ──────────────────── settings ────────────────────

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key)
    }

    pub fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.backend.get(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(&[key], |_| Ok((vec![Mutation::put(key, value)], ())))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.update(&[key], |view| {
            let mutations = if view.get(key).is_some() {
                vec![Mutation::delete(key)]
            } else {
                Vec::new()
            };
            Ok((mutations, ()))
        })
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys()
    }

    // ──────────────────── counters ────────────────────

    /// Increment one counter cell and return its new value.
    ///
    /// `subkey` is required for nested families and must be absent for the
    /// scalar family.
    pub fn increment(
        &self,
        family: CounterFamily,
        day: &DayKey,
        subkey: Option<&str>,
    ) -> Result<u64> {
        validate_cell(family, subkey)?;
        let key = family.raw_key();
        self.update(&[key], |view| {
            let (mutation, value) = self.bump_in_view(view, family, day, subkey);
            Ok((vec![mutation], value))
        })
    }

    /// Increment inside an update that already holds `family.raw_key()`.
    ///
    /// Returns the mutation to commit and the cell's new value.
    pub(crate) fn bump_in_view(
        &self,
        view: &KeyView,
        family: CounterFamily,
        day: &DayKey,
        subkey: Option<&str>,
    ) -> (Mutation, u64) {
        let key = family.raw_key();
        match subkey {
            Some(subkey) if family.is_nested() => {
                let mut counter = self.decode_nested_at(key, view.get(key));
                let cell = counter
                    .entry(day.clone())
                    .or_default()
                    .entry(subkey.to_string())
                    .or_insert(0);
                *cell = cell.saturating_add(1);
                let value = *cell;
                (Mutation::put(key, encode_nested(&counter)), value)
            }
            _ => {
                let mut counter = self.decode_scalar_at(key, view.get(key));
                let cell = counter.entry(day.clone()).or_insert(0);
                *cell = cell.saturating_add(1);
                let value = *cell;
                (Mutation::put(key, encode_scalar(&counter)), value)
            }
        }
    }

    /// Current value of one counter cell (0 when absent).
    pub fn count(&self, family: CounterFamily, day: &DayKey, subkey: Option<&str>) -> Result<u64> {
        validate_cell(family, subkey)?;
        let key = family.raw_key();
        let raw = self.backend.get(key)?;
        let value = match subkey {
            Some(subkey) => self
                .decode_nested_at(key, raw.as_deref())
                .get(day)
                .and_then(|cells| cells.get(subkey))
                .copied(),
            None => self.decode_scalar_at(key, raw.as_deref()).get(day).copied(),
        };
        Ok(value.unwrap_or(0))
    }

    /// Read all three families on one side from committed state.
    pub fn load(&self, side: Side) -> Result<CounterSet> {
        let mut view = KeyView::default();
        for key in side.keys() {
            view.values.insert(key.to_string(), self.backend.get(key)?);
        }
        Ok(self.counter_set(&view, side))
    }

    /// Decode a counter set from a view holding `side.keys()`.
    #[must_use]
    pub fn counter_set(&self, view: &KeyView, side: Side) -> CounterSet {
        let scalar_key = side.key(CounterFamily::AppOpens);
        let tool_key = side.key(CounterFamily::ToolUse);
        let ad_key = side.key(CounterFamily::AdImpressions);
        CounterSet {
            app_opens: self.decode_scalar_at(scalar_key, view.get(scalar_key)),
            tool_use: self.decode_nested_at(tool_key, view.get(tool_key)),
            ad_impressions: self.decode_nested_at(ad_key, view.get(ad_key)),
        }
    }

    // ──────────────────── atomic read-modify-write ────────────────────

    /// Lock `keys`, read them, and commit the closure's mutations atomically.
    ///
    /// Mutations must only touch locked keys. The closure may run more than
    /// once if another process commits to the same keys in between.
    pub fn update<T, F>(&self, keys: &[&str], mut f: F) -> Result<T>
    where
        F: FnMut(&KeyView) -> Result<(Vec<Mutation>, T)>,
    {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let locks: Vec<Arc<Mutex<()>>> = sorted.iter().map(|key| self.key_lock(key)).collect();
        let _guards: Vec<MutexGuard<'_, ()>> = locks.iter().map(|lock| lock.lock()).collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut view = KeyView::default();
            for key in &sorted {
                view.values.insert((*key).to_string(), self.backend.get(key)?);
            }

            let (mutations, out) = f(&view)?;
            debug_assert!(
                mutations.iter().all(|m| sorted.contains(&m.key())),
                "mutation outside locked key set"
            );
            if mutations.is_empty() {
                return Ok(out);
            }

            match self.backend.commit(&view.expectations(), &mutations) {
                Ok(()) => return Ok(out),
                Err(BeaconError::StoreConflict { key }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    eprintln!("[UMB-STORE] concurrent write on {key}, retrying ({attempt})");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    // ──────────────────── lenient decoding ────────────────────

    fn decode_scalar_at(&self, key: &str, raw: Option<&str>) -> ScalarCounter {
        let (counter, report) = decode_scalar(raw);
        self.note_decode(key, report);
        counter
    }

    fn decode_nested_at(&self, key: &str, raw: Option<&str>) -> NestedCounter {
        let (counter, report) = decode_nested(raw);
        self.note_decode(key, report);
        counter
    }

    fn note_decode(&self, key: &str, report: DecodeReport) {
        if !report.is_clean() {
            self.logger.send(ActivityEvent::StoreDecodeRecovered {
                key: key.to_string(),
                malformed: report.malformed,
                skipped_entries: report.skipped_entries,
            });
        }
    }
}

fn validate_cell(family: CounterFamily, subkey: Option<&str>) -> Result<()> {
    match (family.is_nested(), subkey) {
        (true, Some(subkey)) if !subkey.is_empty() => Ok(()),
        (false, None) => Ok(()),
        (true, _) => Err(BeaconError::InvalidCounterKey {
            details: format!("{} requires a non-empty subkey", family.label()),
        }),
        (false, Some(_)) => Err(BeaconError::InvalidCounterKey {
            details: format!("{} does not take a subkey", family.label()),
        }),
    }
}
