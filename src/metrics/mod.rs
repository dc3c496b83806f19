//! Usage metrics: consent, recording, delta batching, and read-only inspection.

pub mod aggregator;
pub mod batcher;
pub mod consent;
pub mod inspector;
pub mod payload;
pub mod queue;
