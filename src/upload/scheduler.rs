//! Upload scheduler: decides when a batch is cut and handed to delivery.
//!
//! State is `Clean | Dirty | Enqueued`, where `Enqueued` is simply "a pending
//! batch exists". Checks are cheap and idempotent, so any trigger (timer,
//! signal, CLI) may call [`UploadScheduler::maybe_schedule`]; a check that
//! overlaps another returns immediately without side effects.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::core::config::{Config, SchedulerConfig, UploadConfig};
use crate::core::errors::{BeaconError, Result};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::metrics::batcher::Batcher;
use crate::metrics::consent::ConsentGate;
use crate::metrics::payload::PendingBatch;
use crate::store::backend::Mutation;
use crate::store::counter_store::{CounterStore, keys};
use crate::upload::target::UploadTarget;
use crate::upload::worker::{DeliveryOutcome, DeliveryWorker};

// ──────────────────── dirty flag ────────────────────

/// Note that new data may exist. Advisory; writes only on a clean→dirty edge.
pub fn mark_dirty(store: &CounterStore) -> Result<()> {
    store.update(&[keys::DIRTY], |view| {
        let mutations = if view.get(keys::DIRTY) == Some("1") {
            Vec::new()
        } else {
            vec![Mutation::put(keys::DIRTY, "1")]
        };
        Ok((mutations, ()))
    })
}

pub fn is_dirty(store: &CounterStore) -> Result<bool> {
    Ok(store.get(keys::DIRTY)?.as_deref() == Some("1"))
}

pub fn last_enqueue_at(store: &CounterStore) -> Result<Option<DateTime<Utc>>> {
    Ok(store
        .get(keys::LAST_ENQUEUE_AT)?
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|t| t.with_timezone(&Utc)))
}

fn clear_dirty(store: &CounterStore) -> Result<()> {
    store.remove(keys::DIRTY)
}

fn record_enqueue(store: &CounterStore, now: DateTime<Utc>) -> Result<()> {
    store.set(
        keys::LAST_ENQUEUE_AT,
        &now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    )
}

// ──────────────────── device conditions ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Offline,
    Metered,
    Unmetered,
}

/// Snapshot of the device state a check runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceConditions {
    pub network: NetworkState,
    pub battery_low: bool,
    pub charging: bool,
}

impl Default for DeviceConditions {
    fn default() -> Self {
        Self {
            network: NetworkState::Unmetered,
            battery_low: false,
            charging: true,
        }
    }
}

impl DeviceConditions {
    /// The first unmet constraint, if any.
    #[must_use]
    pub fn unmet(&self, policy: &SchedulerConfig) -> Option<&'static str> {
        match self.network {
            NetworkState::Offline => return Some("offline"),
            NetworkState::Metered if policy.require_unmetered => return Some("metered network"),
            _ => {}
        }
        if policy.skip_on_low_battery && self.battery_low && !self.charging {
            return Some("battery low");
        }
        None
    }
}

// ──────────────────── decisions ────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "details", rename_all = "snake_case")]
pub enum SkipReason {
    UploadDisabled,
    ConsentNotGranted,
    ConstraintsUnmet(String),
    IntervalNotElapsed,
    /// Nothing recorded since the last cut.
    Clean,
    /// Dirty, but every counter was already sent.
    EmptyDelta,
    /// Delivery is still busy with an earlier hand-off.
    WorkerBusy,
    CheckInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ScheduleDecision {
    Skipped { reason: SkipReason },
    /// An outstanding batch was handed to delivery again.
    Resumed { batch_id: String },
    /// A new batch was cut and handed to delivery.
    Enqueued { batch_id: String },
}

impl ScheduleDecision {
    fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    #[must_use]
    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::Resumed { batch_id } | Self::Enqueued { batch_id } => Some(batch_id),
            Self::Skipped { .. } => None,
        }
    }
}

// ──────────────────── hand-off targets ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Accepted,
    Busy,
}

/// Where a scheduled batch goes.
pub trait DeliveryHandoff: Send + Sync {
    fn hand_off(&self, batch: PendingBatch) -> Result<Handoff>;
}

/// Delivers on the calling thread. Used by one-shot CLI runs and tests.
pub struct InlineHandoff {
    worker: Arc<DeliveryWorker>,
    last_outcome: Mutex<Option<DeliveryOutcome>>,
}

impl InlineHandoff {
    #[must_use]
    pub fn new(worker: Arc<DeliveryWorker>) -> Self {
        Self {
            worker,
            last_outcome: Mutex::new(None),
        }
    }

    /// Outcome of the most recent delivery, consumed on read.
    pub fn take_outcome(&self) -> Option<DeliveryOutcome> {
        self.last_outcome.lock().take()
    }
}

impl DeliveryHandoff for InlineHandoff {
    fn hand_off(&self, batch: PendingBatch) -> Result<Handoff> {
        let outcome = self.worker.deliver(&batch)?;
        *self.last_outcome.lock() = Some(outcome);
        Ok(Handoff::Accepted)
    }
}

/// Sends batches to a dedicated delivery thread, one at a time.
pub struct ChannelHandoff {
    tx: Mutex<Option<Sender<PendingBatch>>>,
    in_flight: Arc<AtomicBool>,
}

impl ChannelHandoff {
    /// Spawn the delivery thread.
    pub fn spawn(
        worker: Arc<DeliveryWorker>,
        logger: ActivityLoggerHandle,
    ) -> Result<(Self, thread::JoinHandle<()>)> {
        let (tx, rx) = bounded::<PendingBatch>(1);
        let in_flight = Arc::new(AtomicBool::new(false));
        let thread_in_flight = Arc::clone(&in_flight);

        let join = thread::Builder::new()
            .name("umb-delivery".to_string())
            .spawn(move || {
                while let Ok(batch) = rx.recv() {
                    if let Err(err) = worker.deliver(&batch) {
                        eprintln!("[UMB-UPLOAD] delivery of {} failed: {err}", batch.batch_id);
                        logger.send(ActivityEvent::from_error(&err));
                    }
                    thread_in_flight.store(false, Ordering::Release);
                }
            })
            .map_err(|source| BeaconError::Runtime {
                details: format!("failed to spawn delivery thread: {source}"),
            })?;

        Ok((
            Self {
                tx: Mutex::new(Some(tx)),
                in_flight,
            },
            join,
        ))
    }

    /// Stop accepting batches; the delivery thread exits after its current one.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl DeliveryHandoff for ChannelHandoff {
    fn hand_off(&self, batch: PendingBatch) -> Result<Handoff> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(BeaconError::ChannelClosed {
                component: "delivery",
            });
        };
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(Handoff::Busy);
        }
        match tx.try_send(batch) {
            Ok(()) => Ok(Handoff::Accepted),
            Err(TrySendError::Full(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Ok(Handoff::Busy)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Err(BeaconError::ChannelClosed {
                    component: "delivery",
                })
            }
        }
    }
}

// ──────────────────── scheduler ────────────────────

pub struct UploadScheduler {
    store: Arc<CounterStore>,
    consent: ConsentGate,
    batcher: Batcher,
    handoff: Arc<dyn DeliveryHandoff>,
    upload: RwLock<UploadConfig>,
    policy: RwLock<SchedulerConfig>,
    check: Mutex<()>,
}

impl UploadScheduler {
    #[must_use]
    pub fn new(
        store: Arc<CounterStore>,
        consent: ConsentGate,
        handoff: Arc<dyn DeliveryHandoff>,
        config: &Config,
    ) -> Self {
        Self {
            batcher: Batcher::new(Arc::clone(&store), consent.clone()),
            store,
            consent,
            handoff,
            upload: RwLock::new(config.upload.clone()),
            policy: RwLock::new(config.scheduler.clone()),
            check: Mutex::new(()),
        }
    }

    /// Apply reloaded configuration to subsequent checks.
    pub fn set_config(&self, config: &Config) {
        *self.upload.write() = config.upload.clone();
        *self.policy.write() = config.scheduler.clone();
    }

    pub fn mark_dirty(&self) -> Result<()> {
        mark_dirty(&self.store)
    }

    /// Cut and hand off a batch if everything allows it right now.
    pub fn maybe_schedule(
        &self,
        conditions: DeviceConditions,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDecision> {
        let Some(_check) = self.check.try_lock() else {
            return Ok(ScheduleDecision::skipped(SkipReason::CheckInProgress));
        };

        let upload = self.upload.read().clone();
        let policy = self.policy.read().clone();

        if UploadTarget::resolve(&self.store, &upload)?.is_none() {
            return Ok(ScheduleDecision::skipped(SkipReason::UploadDisabled));
        }
        if !self.consent.is_enabled()? {
            return Ok(ScheduleDecision::skipped(SkipReason::ConsentNotGranted));
        }
        if let Some(unmet) = conditions.unmet(&policy) {
            return Ok(ScheduleDecision::skipped(SkipReason::ConstraintsUnmet(
                unmet.to_string(),
            )));
        }
        if let Some(last) = last_enqueue_at(&self.store)? {
            // A clock that moved backwards does not hold uploads hostage.
            let since = now.signed_duration_since(last);
            if since >= chrono::TimeDelta::zero()
                && since.to_std().unwrap_or_default() < upload.min_interval()
            {
                return Ok(ScheduleDecision::skipped(SkipReason::IntervalNotElapsed));
            }
        }

        if let Some(pending) = PendingBatch::load(&self.store)? {
            let batch_id = pending.batch_id.clone();
            return match self.handoff.hand_off(pending)? {
                Handoff::Accepted => {
                    record_enqueue(&self.store, now)?;
                    Ok(ScheduleDecision::Resumed { batch_id })
                }
                Handoff::Busy => Ok(ScheduleDecision::skipped(SkipReason::WorkerBusy)),
            };
        }

        if !is_dirty(&self.store)? {
            return Ok(ScheduleDecision::skipped(SkipReason::Clean));
        }

        // Cleared before the cut so anything recorded during it re-marks it.
        // Paths that end without a pending batch restore it.
        clear_dirty(&self.store)?;
        let batch = match self.batcher.compute_delta(now) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                mark_dirty(&self.store)?;
                return Ok(ScheduleDecision::skipped(SkipReason::EmptyDelta));
            }
            Err(BeaconError::BatchOutstanding { .. }) => {
                mark_dirty(&self.store)?;
                return Ok(ScheduleDecision::skipped(SkipReason::WorkerBusy));
            }
            Err(err) => {
                mark_dirty(&self.store)?;
                return Err(err);
            }
        };

        let batch_id = batch.batch_id.clone();
        match self.handoff.hand_off(batch) {
            Ok(Handoff::Accepted) => {
                record_enqueue(&self.store, now)?;
                Ok(ScheduleDecision::Enqueued { batch_id })
            }
            // The cut batch is durable and will be resumed by a later check.
            Ok(Handoff::Busy) => Ok(ScheduleDecision::skipped(SkipReason::WorkerBusy)),
            Err(err) => Err(err),
        }
    }
}
