//! Dual-write coordinator: writes to both SQLite and JSONL with graceful degradation.
//!
//! Architecture: a dedicated logger thread owns the `SqliteLogger` and `JsonlWriter`.
//! All other threads send `ActivityEvent` via a bounded crossbeam channel. Non-blocking
//! `try_send()` keeps recording and delivery paths free of logging back-pressure.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::PathsConfig;
use crate::core::errors::{BeaconError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::{ActivityRow, SqliteLogger};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

/// Consecutive SQLite failures tolerated before the table is abandoned.
#[cfg(feature = "sqlite")]
const MAX_SQLITE_FAILURES: u32 = 3;

// ──────────────────── public event type ────────────────────

/// Events that can be logged through the dual-write coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    ServiceStarted {
        version: String,
        config_hash: String,
        backend: String,
    },
    ServiceStopped {
        reason: String,
        uptime_secs: u64,
    },
    ConsentChanged {
        from: String,
        to: String,
    },
    BatchCut {
        batch_id: String,
        cells: usize,
    },
    BatchDelivered {
        batch_id: String,
        attempts: u32,
        http_status: u16,
        duration_ms: u64,
    },
    /// Remote refused the batch permanently; the snapshot advanced anyway.
    BatchRejected {
        batch_id: String,
        attempts: u32,
        http_status: u16,
    },
    BatchDeferred {
        batch_id: String,
        attempts: u32,
        http_status: Option<u16>,
        reason: String,
    },
    /// Pending batch was already acknowledged before a crash; cleared without resend.
    BatchReconciled {
        batch_id: String,
    },
    /// Stored pending batch was unreadable and dropped.
    BatchDiscarded {
        details: String,
    },
    StoreDecodeRecovered {
        key: String,
        malformed: bool,
        skipped_entries: usize,
    },
    RecordingDropped {
        dropped: u64,
    },
    ConfigReloaded {
        details: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

impl ActivityEvent {
    /// Wrap a crate error for logging.
    #[must_use]
    pub fn from_error(err: &BeaconError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ──────────────────── public handle ────────────────────

/// Thread-safe, cheaply-cloneable handle for sending log events.
///
/// Internally wraps a bounded crossbeam `Sender`. The `send()` method uses
/// `try_send()` so callers are never blocked by logging back-pressure.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    fn with_sender(tx: Sender<ActivityEvent>) -> Self {
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle whose events go nowhere (library use without a logger thread).
    #[must_use]
    pub fn noop() -> Self {
        let (tx, _rx) = bounded(1);
        Self::with_sender(tx)
    }

    /// Handle plus the receiving end, for inspecting emitted events in tests.
    #[must_use]
    pub fn capture() -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        (Self::with_sender(tx), rx)
    }

    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and the dropped-events counter
    /// is incremented.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown and for noop handles.
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown of the logger thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── configuration ────────────────────

/// Options for building the dual-write logger.
pub struct DualLoggerConfig {
    /// Path to the SQLite database. `None` disables SQLite.
    pub sqlite_path: Option<PathBuf>,
    /// JSONL writer config (always active).
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl DualLoggerConfig {
    #[must_use]
    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            sqlite_path: Some(paths.activity_db.clone()),
            jsonl_config: JsonlConfig::at(paths.activity_jsonl.clone()),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

impl Default for DualLoggerConfig {
    fn default() -> Self {
        Self::from_paths(&PathsConfig::default())
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle.
///
/// The logger thread runs until `handle.shutdown()` is called or all senders
/// are dropped.
pub fn spawn_logger(
    config: DualLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let handle = ActivityLoggerHandle::with_sender(tx);
    let dropped = Arc::clone(&handle.dropped_events);

    let join = thread::Builder::new()
        .name("umb-logger".to_string())
        .spawn(move || {
            logger_thread_main(&rx, config.sqlite_path, config.jsonl_config, &dropped);
        })
        .map_err(|e| BeaconError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    sqlite_path: Option<PathBuf>,
    jsonl_config: JsonlConfig,
    dropped: &AtomicU64,
) {
    #[cfg(feature = "sqlite")]
    let mut sqlite = sqlite_path.and_then(|p| match SqliteLogger::open(&p) {
        Ok(db) => Some(db),
        Err(e) => {
            eprintln!("[UMB-DUAL] failed to open SQLite at {}: {e}", p.display());
            None
        }
    });
    #[cfg(not(feature = "sqlite"))]
    let _ = sqlite_path;
    #[cfg(feature = "sqlite")]
    let mut sqlite_failures: u32 = 0;

    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        let entry = event_to_log_entry(&event);
        jsonl.write_entry(&entry);

        #[cfg(feature = "sqlite")]
        if let Some(db) = &sqlite {
            if db.log_activity(&entry_to_activity_row(&entry)).is_ok() {
                sqlite_failures = 0;
            } else {
                sqlite_failures += 1;
                if sqlite_failures >= MAX_SQLITE_FAILURES {
                    eprintln!("[UMB-DUAL] SQLite write failed {sqlite_failures} times, disabling");
                    sqlite = None;
                }
            }
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

#[allow(clippy::too_many_lines)]
pub(crate) fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::ServiceStarted {
            version,
            config_hash,
            backend,
        } => {
            let mut e = LogEntry::new(EventType::ServiceStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} backend={backend}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ServiceStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::ServiceStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ConsentChanged { from, to } => {
            let mut e = LogEntry::new(EventType::ConsentChange, Severity::Info);
            e.details = Some(format!("{from}->{to}"));
            e
        }
        ActivityEvent::BatchCut { batch_id, cells } => {
            let mut e = LogEntry::new(EventType::BatchCut, Severity::Info);
            e.batch_id = Some(batch_id.clone());
            e.cells = Some(*cells as u64);
            e
        }
        ActivityEvent::BatchDelivered {
            batch_id,
            attempts,
            http_status,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::UploadDelivered, Severity::Info);
            e.batch_id = Some(batch_id.clone());
            e.attempts = Some(*attempts);
            e.http_status = Some(*http_status);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::BatchRejected {
            batch_id,
            attempts,
            http_status,
        } => {
            let mut e = LogEntry::new(EventType::UploadRejected, Severity::Critical);
            e.batch_id = Some(batch_id.clone());
            e.attempts = Some(*attempts);
            e.http_status = Some(*http_status);
            e.ok = Some(false);
            e.details = Some("snapshot advanced; batch will not be retried".to_string());
            e
        }
        ActivityEvent::BatchDeferred {
            batch_id,
            attempts,
            http_status,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::UploadDeferred, Severity::Warning);
            e.batch_id = Some(batch_id.clone());
            e.attempts = Some(*attempts);
            e.http_status = *http_status;
            e.ok = Some(false);
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::BatchReconciled { batch_id } => {
            let mut e = LogEntry::new(EventType::UploadReconciled, Severity::Info);
            e.batch_id = Some(batch_id.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::BatchDiscarded { details } => {
            let mut e = LogEntry::new(EventType::StoreRecovered, Severity::Warning);
            e.key = Some(crate::store::counter_store::keys::PENDING_BATCH.to_string());
            e.details = Some(details.clone());
            e
        }
        ActivityEvent::StoreDecodeRecovered {
            key,
            malformed,
            skipped_entries,
        } => {
            let mut e = LogEntry::new(EventType::StoreRecovered, Severity::Warning);
            e.key = Some(key.clone());
            e.details = Some(format!(
                "malformed={malformed} skipped_entries={skipped_entries}"
            ));
            e
        }
        ActivityEvent::RecordingDropped { dropped } => {
            let mut e = LogEntry::new(EventType::RecordingDropped, Severity::Warning);
            e.details = Some(format!("{dropped} recordings dropped on full queues"));
            e
        }
        ActivityEvent::ConfigReloaded { details } => {
            let mut e = LogEntry::new(EventType::ConfigReload, Severity::Info);
            e.details = Some(details.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        // Handled by the thread loop before conversion.
        ActivityEvent::Shutdown => LogEntry::new(EventType::ServiceStop, Severity::Info),
    }
}

#[cfg(feature = "sqlite")]
#[allow(clippy::cast_possible_wrap)]
fn entry_to_activity_row(entry: &LogEntry) -> ActivityRow {
    ActivityRow {
        timestamp: entry.ts.clone(),
        event_type: entry.event.as_str().to_string(),
        severity: entry.severity.as_str().to_string(),
        batch_id: entry.batch_id.clone(),
        cells: entry.cells.map(|c| c as i64),
        attempts: entry.attempts.map(i64::from),
        http_status: entry.http_status.map(i64::from),
        store_key: entry.key.clone(),
        duration_ms: entry.duration_ms.map(|d| d as i64),
        success: i32::from(entry.ok.unwrap_or(true)),
        error_code: entry.error_code.clone(),
        error_message: entry.error_message.clone(),
        details: entry.details.clone(),
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path, sqlite: bool) -> DualLoggerConfig {
        DualLoggerConfig {
            sqlite_path: sqlite.then(|| dir.join("activity.sqlite3")),
            jsonl_config: JsonlConfig {
                path: dir.join("activity.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
        }
    }

    fn started() -> ActivityEvent {
        ActivityEvent::ServiceStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc".to_string(),
            backend: "memory".to_string(),
        }
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), true)).unwrap();
        handle.send(started());
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert!(contents.contains("service_start"));
    }

    #[test]
    fn delivery_events_reach_both_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), true)).unwrap();
        handle.send(ActivityEvent::BatchCut {
            batch_id: "20260301T100000Z-0a1b2c3d".to_string(),
            cells: 2,
        });
        handle.send(ActivityEvent::BatchDelivered {
            batch_id: "20260301T100000Z-0a1b2c3d".to_string(),
            attempts: 4,
            http_status: 200,
            duration_ms: 1500,
        });
        handle.send(ActivityEvent::BatchRejected {
            batch_id: "20260301T110000Z-deadbeef".to_string(),
            attempts: 1,
            http_status: 400,
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains("\"severity\":\"critical\""));

        #[cfg(feature = "sqlite")]
        {
            let db = SqliteLogger::open(&dir.path().join("activity.sqlite3")).unwrap();
            let rows = db.recent_activity(10).unwrap();
            assert_eq!(rows.len(), 3);
            assert_eq!(rows[0].event_type, "upload_rejected");
            assert_eq!(rows[0].success, 0);
            assert_eq!(rows[1].attempts, Some(4));
        }
    }

    #[test]
    fn sqlite_disabled_when_path_none() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        handle.send(ActivityEvent::from_error(&BeaconError::Transport {
            details: "connection reset".to_string(),
        }));
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert!(contents.contains("UMB-3001"));
        assert!(!dir.path().join("activity.sqlite3").exists());
    }

    #[test]
    fn capture_receives_sent_events() {
        let (handle, rx) = ActivityLoggerHandle::capture();
        handle.send(ActivityEvent::BatchReconciled {
            batch_id: "b".to_string(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            ActivityEvent::BatchReconciled {
                batch_id: "b".to_string()
            }
        );
    }

    #[test]
    fn noop_handle_never_blocks_or_counts() {
        let handle = ActivityLoggerHandle::noop();
        for _ in 0..10 {
            handle.send(started());
        }
        assert_eq!(handle.dropped_events(), 0);
    }

    #[test]
    fn full_channel_counts_drops() {
        let (tx, _rx) = bounded(1);
        let handle = ActivityLoggerHandle::with_sender(tx);
        handle.send(started());
        handle.send(started());
        handle.send(started());
        assert_eq!(handle.dropped_events(), 2);
    }
}
