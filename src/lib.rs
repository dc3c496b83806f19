#![forbid(unsafe_code)]

//! Usage beacon: on-device usage counters with consent gating, delta
//! batching, and effectively-once upload.
//!
//! Recording calls increment per-day counters in a durable store, but only
//! while consent is granted. The scheduler periodically cuts the difference
//! between recorded and acknowledged totals into a batch, and the delivery
//! worker POSTs it until the server acknowledges it, advancing the sent
//! snapshot in the same commit that retires the batch.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use usage_beacon::prelude::*;
//!
//! # fn main() -> usage_beacon::core::errors::Result<()> {
//! let service = BeaconService::open(Config::load(None)?)?;
//! service.set_consent(true)?;
//! service.record_tool_use("qr");
//! service.flush_recordings();
//! let decision = service.check_now(DeviceConditions::default())?;
//! println!("{decision:?}");
//! service.shutdown("done");
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
pub mod metrics;
pub mod store;
pub mod upload;
