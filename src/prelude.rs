//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use usage_beacon::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, DayKey, ManualClock, SystemClock, day_key};
pub use crate::core::config::Config;
pub use crate::core::errors::{BeaconError, Result};

// Store
pub use crate::store::backend::{MemoryBackend, StorageBackend};
pub use crate::store::counter_store::{CounterFamily, CounterSet, CounterStore, Side};

// Metrics
pub use crate::metrics::aggregator::{Aggregator, RecordOutcome};
pub use crate::metrics::consent::{ConsentGate, ConsentState};
pub use crate::metrics::inspector::{DiagnosticsSnapshot, Inspector};
pub use crate::metrics::payload::{PendingBatch, UploadPayload};
pub use crate::metrics::queue::RecordingQueue;

// Upload
pub use crate::upload::scheduler::{
    DeviceConditions, NetworkState, ScheduleDecision, SkipReason, UploadScheduler,
};
pub use crate::upload::transport::{Transport, TransportError, UploadRequest, UreqTransport};
pub use crate::upload::worker::{DeliveryOutcome, DeliveryWorker};

// Service
pub use crate::daemon::service::{BeaconService, DeliveryMode, ServiceOptions};
pub use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
