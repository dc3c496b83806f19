//! `BeaconService`: the composition root that owns every long-lived part.
//!
//! One instance per process. The entry point builds it, drives it (CLI
//! one-shot or the service loop), and shuts it down; nothing here is a global.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, spawn_logger};
use crate::metrics::aggregator::Aggregator;
use crate::metrics::consent::{ConsentGate, ConsentState};
use crate::metrics::inspector::{DiagnosticsSnapshot, Inspector};
use crate::metrics::queue::RecordingQueue;
use crate::store::backend::StorageBackend;
use crate::store::counter_store::CounterStore;
use crate::store::open_backend;
use crate::upload::scheduler::{
    ChannelHandoff, DeliveryHandoff, DeviceConditions, InlineHandoff, ScheduleDecision,
    UploadScheduler,
};
use crate::upload::target::UploadTarget;
use crate::upload::transport::{Transport, UreqTransport};
use crate::upload::worker::{DeliveryOutcome, DeliveryWorker};

/// Where scheduled batches are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// On the thread that ran the check; the outcome is available right after.
    #[default]
    Inline,
    /// On a dedicated delivery thread.
    Background,
}

/// Injection points. Anything left `None` is built from configuration.
#[derive(Default)]
pub struct ServiceOptions {
    pub backend: Option<Arc<dyn StorageBackend>>,
    pub transport: Option<Arc<dyn Transport>>,
    pub clock: Option<Arc<dyn Clock>>,
    /// Use an existing logger instead of spawning the dual-write thread.
    pub logger: Option<ActivityLoggerHandle>,
    pub delivery: DeliveryMode,
}

enum Delivery {
    Inline(Arc<InlineHandoff>),
    Background {
        handoff: Arc<ChannelHandoff>,
        join: Mutex<Option<thread::JoinHandle<()>>>,
    },
}

pub struct BeaconService {
    config: RwLock<Config>,
    clock: Arc<dyn Clock>,
    store: Arc<CounterStore>,
    consent: ConsentGate,
    queue: RecordingQueue,
    worker: Arc<DeliveryWorker>,
    scheduler: UploadScheduler,
    inspector: Inspector,
    delivery: Delivery,
    logger: ActivityLoggerHandle,
    logger_join: Mutex<Option<thread::JoinHandle<()>>>,
    started: Instant,
    stopped: AtomicBool,
}

impl BeaconService {
    /// Open with everything built from configuration.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, ServiceOptions::default())
    }

    pub fn open_with(config: Config, options: ServiceOptions) -> Result<Self> {
        let started = Instant::now();

        let (logger, logger_join) = match options.logger {
            Some(handle) => (handle, None),
            None => {
                let (handle, join) = spawn_logger(DualLoggerConfig::from_paths(&config.paths))?;
                (handle, Some(join))
            }
        };

        let backend = match options.backend {
            Some(backend) => backend,
            None => open_backend(&config)?,
        };
        let store = Arc::new(CounterStore::new(backend, logger.clone()));
        let consent = ConsentGate::new(Arc::clone(&store))?;
        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store),
            consent.clone(),
            Arc::clone(&clock),
        ));
        let queue = RecordingQueue::spawn(aggregator, &config.recording, logger.clone())?;

        let transport = options
            .transport
            .unwrap_or_else(|| {
                Arc::new(UreqTransport::new(config.upload.timeout())) as Arc<dyn Transport>
            });
        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&store),
            transport,
            config.upload.clone(),
        ));

        let (delivery, handoff): (Delivery, Arc<dyn DeliveryHandoff>) = match options.delivery {
            DeliveryMode::Inline => {
                let inline = Arc::new(InlineHandoff::new(Arc::clone(&worker)));
                (
                    Delivery::Inline(Arc::clone(&inline)),
                    inline as Arc<dyn DeliveryHandoff>,
                )
            }
            DeliveryMode::Background => {
                let (channel, join) = ChannelHandoff::spawn(Arc::clone(&worker), logger.clone())?;
                let channel = Arc::new(channel);
                (
                    Delivery::Background {
                        handoff: Arc::clone(&channel),
                        join: Mutex::new(Some(join)),
                    },
                    channel as Arc<dyn DeliveryHandoff>,
                )
            }
        };

        let scheduler =
            UploadScheduler::new(Arc::clone(&store), consent.clone(), handoff, &config);
        let inspector = Inspector::new(
            Arc::clone(&store),
            consent.clone(),
            config.upload.clone(),
        );

        logger.send(ActivityEvent::ServiceStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: config.stable_hash().unwrap_or_default(),
            backend: store.backend_name().to_string(),
        });

        Ok(Self {
            config: RwLock::new(config),
            clock,
            store,
            consent,
            queue,
            worker,
            scheduler,
            inspector,
            delivery,
            logger,
            logger_join: Mutex::new(logger_join),
            started,
            stopped: AtomicBool::new(false),
        })
    }

    // ──────────────────── recording ────────────────────

    pub fn record_app_open(&self) -> bool {
        self.queue.record_app_open()
    }

    pub fn record_daily_open_once(&self) -> bool {
        self.queue.record_daily_open_once()
    }

    pub fn record_tool_use(&self, tool_id: &str) -> bool {
        self.queue.record_tool_use(tool_id)
    }

    pub fn record_ad_impression(&self, ad_type: &str) -> bool {
        self.queue.record_ad_impression(ad_type)
    }

    /// Wait until every recording queued so far is in the store.
    pub fn flush_recordings(&self) {
        self.queue.flush();
    }

    pub fn dropped_recordings(&self) -> u64 {
        self.queue.dropped()
    }

    // ──────────────────── consent ────────────────────

    pub fn set_consent(&self, enabled: bool) -> Result<()> {
        self.consent.set_consent(enabled)
    }

    pub fn get_consent(&self) -> Result<bool> {
        self.consent.is_enabled()
    }

    pub fn has_decided_consent(&self) -> Result<bool> {
        self.consent.has_decided()
    }

    pub fn consent_state(&self) -> Result<ConsentState> {
        self.consent.state()
    }

    // ──────────────────── upload target ────────────────────

    pub fn upload_target(&self) -> Result<Option<UploadTarget>> {
        UploadTarget::resolve(&self.store, &self.config.read().upload)
    }

    pub fn set_endpoint(&self, url: &str) -> Result<()> {
        UploadTarget::set_endpoint(&self.store, url)
    }

    pub fn set_api_key(&self, api_key: &str) -> Result<()> {
        UploadTarget::set_api_key(&self.store, api_key)
    }

    pub fn disable_uploads(&self) -> Result<()> {
        UploadTarget::disable(&self.store)
    }

    pub fn reset_upload_target(&self) -> Result<()> {
        UploadTarget::reset(&self.store)
    }

    // ──────────────────── scheduling ────────────────────

    /// Run one scheduling check under `conditions`.
    pub fn check_now(&self, conditions: DeviceConditions) -> Result<ScheduleDecision> {
        self.scheduler.maybe_schedule(conditions, self.clock.now())
    }

    /// Outcome of the last inline delivery, consumed on read. Always `None`
    /// in background mode.
    pub fn take_delivery_outcome(&self) -> Option<DeliveryOutcome> {
        match &self.delivery {
            Delivery::Inline(inline) => inline.take_outcome(),
            Delivery::Background { .. } => None,
        }
    }

    /// Whether the background delivery thread is busy with a batch.
    pub fn delivery_busy(&self) -> bool {
        match &self.delivery {
            Delivery::Inline(_) => false,
            Delivery::Background { handoff, .. } => handoff.is_busy(),
        }
    }

    pub fn snapshot(&self) -> Result<DiagnosticsSnapshot> {
        self.inspector.snapshot()
    }

    // ──────────────────── configuration ────────────────────

    #[must_use]
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.config.read().scheduler.check_interval_secs.max(1))
    }

    /// Apply a reloaded configuration. Returns `false` if nothing changed.
    ///
    /// Store backend, paths, and recording queue sizing take effect on the
    /// next start only.
    pub fn apply_config(&self, new_config: Config) -> Result<bool> {
        let old_hash = self.config.read().stable_hash()?;
        let new_hash = new_config.stable_hash()?;
        if old_hash == new_hash {
            return Ok(false);
        }
        self.worker.set_upload_config(new_config.upload.clone());
        self.scheduler.set_config(&new_config);
        self.inspector.set_seed(new_config.upload.clone());
        self.logger.send(ActivityEvent::ConfigReloaded {
            details: format!("config hash: {old_hash} -> {new_hash}"),
        });
        *self.config.write() = new_config;
        Ok(true)
    }

    pub fn logger(&self) -> &ActivityLoggerHandle {
        &self.logger
    }

    // ──────────────────── shutdown ────────────────────

    /// Drain recordings, stop delivery after its current batch, and stop the
    /// logger. Safe to call more than once.
    pub fn shutdown(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let uptime_secs = self.started.elapsed().as_secs();

        self.queue.shutdown();

        if let Delivery::Background { handoff, join } = &self.delivery {
            handoff.close();
            if let Some(join) = join.lock().take() {
                let _ = join.join();
            }
        }

        self.logger.send(ActivityEvent::ServiceStopped {
            reason: reason.to_string(),
            uptime_secs,
        });

        if let Some(join) = self.logger_join.lock().take() {
            self.logger.shutdown();
            let _ = join.join();
        }
    }
}

impl Drop for BeaconService {
    fn drop(&mut self) {
        self.shutdown("dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{DayKey, ManualClock};
    use crate::store::backend::MemoryBackend;
    use crate::store::counter_store::CounterFamily;
    use crate::upload::transport::fake::ScriptedTransport;
    use chrono::{TimeZone, Utc};

    struct Harness {
        service: BeaconService,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
    }

    fn harness(statuses: &[u16], delivery: DeliveryMode) -> Harness {
        let mut config = Config::default();
        config.upload.endpoint = "https://metrics.example/v1/usage".to_string();
        config.upload.api_key = "key-123".to_string();
        config.upload.initial_backoff_ms = 1;
        config.upload.max_backoff_ms = 2;
        let transport = Arc::new(ScriptedTransport::statuses(statuses));
        let clock = Arc::new(ManualClock::utc(
            Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
        ));
        let service = BeaconService::open_with(
            config,
            ServiceOptions {
                backend: Some(Arc::new(MemoryBackend::new())),
                transport: Some(Arc::clone(&transport) as Arc<dyn Transport>),
                clock: Some(Arc::clone(&clock) as Arc<dyn Clock>),
                logger: Some(ActivityLoggerHandle::noop()),
                delivery,
            },
        )
        .unwrap();
        Harness {
            service,
            transport,
            clock,
        }
    }

    #[test]
    fn record_check_and_deliver_inline() {
        let h = harness(&[], DeliveryMode::Inline);
        h.service.set_consent(true).unwrap();
        assert!(h.service.record_tool_use("qr"));
        assert!(h.service.record_daily_open_once());
        h.service.flush_recordings();

        let decision = h.service.check_now(DeviceConditions::default()).unwrap();
        assert!(matches!(decision, ScheduleDecision::Enqueued { .. }));
        assert!(matches!(
            h.service.take_delivery_outcome(),
            Some(DeliveryOutcome::Delivered { .. })
        ));

        let snap = h.service.snapshot().unwrap();
        assert!(snap.pending.is_none());
        assert!(snap.unsent.is_empty());
        let day = DayKey::parse("2024-03-05").unwrap();
        assert_eq!(snap.sent.tool_use[&day]["qr"], 1);
        assert_eq!(snap.sent.app_opens[&day], 1);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[test]
    fn consent_api_round_trip() {
        let h = harness(&[], DeliveryMode::Inline);
        assert!(!h.service.get_consent().unwrap());
        assert!(!h.service.has_decided_consent().unwrap());
        h.service.set_consent(false).unwrap();
        assert!(h.service.has_decided_consent().unwrap());
        h.service.record_app_open();
        h.service.flush_recordings();
        let day = DayKey::parse("2024-03-05").unwrap();
        assert_eq!(
            h.service
                .store
                .count(CounterFamily::AppOpens, &day, None)
                .unwrap(),
            0
        );
    }

    #[test]
    fn background_delivery_drains_before_shutdown() {
        let h = harness(&[], DeliveryMode::Background);
        h.service.set_consent(true).unwrap();
        h.service.record_ad_impression("banner");
        h.service.flush_recordings();
        let decision = h.service.check_now(DeviceConditions::default()).unwrap();
        assert!(matches!(decision, ScheduleDecision::Enqueued { .. }));
        h.service.shutdown("test");
        assert!(h.service.snapshot().unwrap().pending.is_none());
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[test]
    fn apply_config_updates_the_seed() {
        let h = harness(&[], DeliveryMode::Inline);
        let mut next = h.service.config();
        assert!(!h.service.apply_config(next.clone()).unwrap());
        next.upload.endpoint = String::new();
        assert!(h.service.apply_config(next).unwrap());
        assert!(h.service.upload_target().unwrap().is_none());
        h.clock.advance(chrono::Duration::hours(1));
        h.service.set_consent(true).unwrap();
        h.service.record_app_open();
        h.service.flush_recordings();
        assert_eq!(
            h.service.check_now(DeviceConditions::default()).unwrap(),
            ScheduleDecision::Skipped {
                reason: crate::upload::scheduler::SkipReason::UploadDisabled
            }
        );
    }
}
