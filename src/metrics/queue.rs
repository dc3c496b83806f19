//! Fire-and-forget recording front over the [`Aggregator`].
//!
//! Each counter family maps to one shard (a bounded channel plus a worker
//! thread), so increments to the same key are applied in submission order
//! while different families proceed in parallel. Submission never blocks: a
//! full shard drops the recording and counts it.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;

use crate::core::config::RecordingConfig;
use crate::core::errors::{BeaconError, Result};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::metrics::aggregator::Aggregator;
use crate::store::counter_store::CounterFamily;

/// One recording call, queued for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recording {
    AppOpen,
    DailyOpen,
    ToolUse(String),
    AdImpression(String),
}

impl Recording {
    #[must_use]
    pub const fn family(&self) -> CounterFamily {
        match self {
            Self::AppOpen | Self::DailyOpen => CounterFamily::AppOpens,
            Self::ToolUse(_) => CounterFamily::ToolUse,
            Self::AdImpression(_) => CounterFamily::AdImpressions,
        }
    }

    fn apply(&self, aggregator: &Aggregator) -> Result<()> {
        match self {
            Self::AppOpen => aggregator.record_app_open(),
            Self::DailyOpen => aggregator.record_daily_open_once(),
            Self::ToolUse(id) => aggregator.record_tool_use(id),
            Self::AdImpression(ad) => aggregator.record_ad_impression(ad),
        }
        .map(|_| ())
    }
}

enum Job {
    Record(Recording),
    /// Barrier: acknowledged once every job queued before it has been applied.
    Flush(Sender<()>),
    Stop,
}

/// Sharded, bounded recording queue.
pub struct RecordingQueue {
    shards: Vec<Sender<Job>>,
    joins: Mutex<Vec<thread::JoinHandle<()>>>,
    dropped: AtomicU64,
    unreported: AtomicU64,
    logger: ActivityLoggerHandle,
}

impl RecordingQueue {
    /// Spawn one worker per shard.
    pub fn spawn(
        aggregator: Arc<Aggregator>,
        config: &RecordingConfig,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        let shard_count = config.workers.clamp(1, CounterFamily::ALL.len());
        let mut shards = Vec::with_capacity(shard_count);
        let mut joins = Vec::with_capacity(shard_count);

        for index in 0..shard_count {
            let (tx, rx) = bounded::<Job>(config.queue_capacity);
            let aggregator = Arc::clone(&aggregator);
            let worker_logger = logger.clone();
            let join = thread::Builder::new()
                .name(format!("umb-record-{index}"))
                .spawn(move || shard_main(&rx, &aggregator, &worker_logger))
                .map_err(|source| BeaconError::Runtime {
                    details: format!("failed to spawn recording worker {index}: {source}"),
                })?;
            shards.push(tx);
            joins.push(join);
        }

        Ok(Self {
            shards,
            joins: Mutex::new(joins),
            dropped: AtomicU64::new(0),
            unreported: AtomicU64::new(0),
            logger,
        })
    }

    /// Queue a recording. Returns `false` if it was dropped.
    pub fn submit(&self, recording: Recording) -> bool {
        let shard = &self.shards[recording.family().index() % self.shards.len()];
        match shard.try_send(Job::Record(recording)) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.unreported.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn record_app_open(&self) -> bool {
        self.submit(Recording::AppOpen)
    }

    pub fn record_daily_open_once(&self) -> bool {
        self.submit(Recording::DailyOpen)
    }

    pub fn record_tool_use(&self, tool_id: &str) -> bool {
        self.submit(Recording::ToolUse(tool_id.to_string()))
    }

    pub fn record_ad_impression(&self, ad_type: &str) -> bool {
        self.submit(Recording::AdImpression(ad_type.to_string()))
    }

    /// Total recordings dropped on full queues since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Block until everything queued so far has been applied.
    pub fn flush(&self) {
        let acks: Vec<Receiver<()>> = self
            .shards
            .iter()
            .filter_map(|shard| {
                let (ack_tx, ack_rx) = bounded(1);
                shard.send(Job::Flush(ack_tx)).ok().map(|()| ack_rx)
            })
            .collect();
        for ack in acks {
            let _ = ack.recv();
        }
        self.report_drops();
    }

    /// Drain all shards and join the workers. Later submissions are dropped.
    pub fn shutdown(&self) {
        for shard in &self.shards {
            let _ = shard.send(Job::Stop);
        }
        for join in self.joins.lock().drain(..) {
            let _ = join.join();
        }
        self.report_drops();
    }

    /// Log drops accumulated since the last report.
    pub fn report_drops(&self) {
        let n = self.unreported.swap(0, Ordering::Relaxed);
        if n > 0 {
            self.logger.send(ActivityEvent::RecordingDropped { dropped: n });
        }
    }
}

impl Drop for RecordingQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn shard_main(rx: &Receiver<Job>, aggregator: &Aggregator, logger: &ActivityLoggerHandle) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Record(recording) => {
                if let Err(err) = recording.apply(aggregator) {
                    eprintln!("[UMB-RECORD] {recording:?} failed: {err}");
                    logger.send(ActivityEvent::from_error(&err));
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            Job::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{DayKey, ManualClock};
    use crate::metrics::consent::ConsentGate;
    use crate::store::backend::MemoryBackend;
    use crate::store::counter_store::CounterStore;
    use chrono::{TimeZone, Utc};

    fn setup(capacity: usize, granted: bool) -> (Arc<CounterStore>, RecordingQueue) {
        let store = Arc::new(CounterStore::new(
            Arc::new(MemoryBackend::new()),
            ActivityLoggerHandle::noop(),
        ));
        let consent = ConsentGate::new(Arc::clone(&store)).unwrap();
        consent.set_consent(granted).unwrap();
        let clock = Arc::new(ManualClock::utc(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&store), consent, clock));
        let config = RecordingConfig {
            queue_capacity: capacity,
            workers: 3,
        };
        let queue = RecordingQueue::spawn(aggregator, &config, ActivityLoggerHandle::noop()).unwrap();
        (store, queue)
    }

    fn day() -> DayKey {
        DayKey::parse("2024-01-01").unwrap()
    }

    #[test]
    fn flush_waits_for_all_recordings() {
        let (store, queue) = setup(1024, true);
        for _ in 0..100 {
            assert!(queue.record_tool_use("qr"));
        }
        queue.record_app_open();
        queue.record_daily_open_once();
        queue.record_ad_impression("banner");
        queue.flush();

        assert_eq!(
            store.count(CounterFamily::ToolUse, &day(), Some("qr")).unwrap(),
            100
        );
        assert_eq!(store.count(CounterFamily::AppOpens, &day(), None).unwrap(), 2);
        assert_eq!(
            store
                .count(CounterFamily::AdImpressions, &day(), Some("banner"))
                .unwrap(),
            1
        );
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn denied_consent_records_nothing() {
        let (store, queue) = setup(64, false);
        queue.record_tool_use("qr");
        queue.record_app_open();
        queue.flush();
        assert_eq!(
            store.count(CounterFamily::ToolUse, &day(), Some("qr")).unwrap(),
            0
        );
    }

    #[test]
    fn submissions_after_shutdown_are_dropped() {
        let (_store, queue) = setup(64, true);
        queue.shutdown();
        assert!(!queue.record_app_open());
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn families_map_to_fixed_shards() {
        assert_eq!(Recording::AppOpen.family(), Recording::DailyOpen.family());
        assert_eq!(
            Recording::ToolUse("a".into()).family(),
            CounterFamily::ToolUse
        );
    }
}
