//! Delivery worker: sends the pending batch and advances the sent snapshot.
//!
//! The acknowledgment commit is one atomic store update: sent counters grow by
//! the batch's delta, the batch id is recorded as last acknowledged, and the
//! pending record is deleted. A crash before that commit resends the same
//! bytes under the same idempotency key; a crash after it is recognised by the
//! last-acknowledged id and reconciled without a resend.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::core::config::UploadConfig;
use crate::core::errors::{BeaconError, Result};
use crate::logger::dual::ActivityEvent;
use crate::metrics::payload::{PendingBatch, advance};
use crate::store::backend::Mutation;
use crate::store::counter_store::{CounterStore, Side, keys};
use crate::upload::target::UploadTarget;
use crate::upload::transport::{
    StatusClass, Transport, TransportError, UploadRequest, classify_status,
};

/// Result of one delivery invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// 2xx received; snapshot advanced.
    Delivered {
        batch_id: String,
        attempts: u32,
        status: u16,
    },
    /// Permanent 4xx; snapshot advanced so the batch is never retried.
    Rejected {
        batch_id: String,
        attempts: u32,
        status: u16,
    },
    /// Gave up for now; the pending batch is untouched.
    Deferred {
        batch_id: String,
        attempts: u32,
        reason: String,
    },
    /// Snapshot already reflected this batch; pending record cleared.
    AlreadyAcknowledged { batch_id: String },
    /// No endpoint configured.
    Disabled,
    NothingPending,
}

impl DeliveryOutcome {
    /// Whether the pending batch is gone after this outcome.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Delivered { .. } | Self::Rejected { .. } | Self::AlreadyAcknowledged { .. }
        )
    }
}

/// Bounded exponential backoff between send attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before attempt `attempt` (1-based; the first attempt has none).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        self.initial_backoff
            .saturating_mul(1_u32 << doublings)
            .min(self.max_backoff)
    }
}

pub struct DeliveryWorker {
    store: Arc<CounterStore>,
    transport: Arc<dyn Transport>,
    upload: RwLock<UploadConfig>,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(store: Arc<CounterStore>, transport: Arc<dyn Transport>, upload: UploadConfig) -> Self {
        Self {
            store,
            transport,
            upload: RwLock::new(upload),
        }
    }

    /// Swap in reloaded upload settings; takes effect on the next delivery.
    pub fn set_upload_config(&self, upload: UploadConfig) {
        *self.upload.write() = upload;
    }

    /// Deliver whatever batch is pending, if any.
    pub fn deliver_pending(&self) -> Result<DeliveryOutcome> {
        match PendingBatch::load(&self.store)? {
            Some(batch) => self.deliver(&batch),
            None => Ok(DeliveryOutcome::NothingPending),
        }
    }

    /// Send `batch` with bounded retries and settle it on acknowledgment.
    pub fn deliver(&self, batch: &PendingBatch) -> Result<DeliveryOutcome> {
        if self.store.get(keys::LAST_ACKED_BATCH)?.as_deref() == Some(batch.batch_id.as_str()) {
            self.clear_pending(&batch.batch_id)?;
            self.store.logger().send(ActivityEvent::BatchReconciled {
                batch_id: batch.batch_id.clone(),
            });
            return Ok(DeliveryOutcome::AlreadyAcknowledged {
                batch_id: batch.batch_id.clone(),
            });
        }

        let upload = self.upload.read().clone();
        let Some(target) = UploadTarget::resolve(&self.store, &upload)? else {
            return Ok(DeliveryOutcome::Disabled);
        };
        let policy = RetryPolicy::from_config(&upload);
        let request = UploadRequest {
            url: &target.endpoint,
            api_key: &target.api_key,
            idempotency_key: &batch.batch_id,
            body: &batch.payload,
        };

        let started = Instant::now();
        let mut last_status = None;
        let mut last_failure = String::new();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            match self.transport.post(&request) {
                Ok(status) => {
                    last_status = Some(status);
                    match classify_status(status) {
                        StatusClass::Success => {
                            self.acknowledge(batch)?;
                            self.store.logger().send(ActivityEvent::BatchDelivered {
                                batch_id: batch.batch_id.clone(),
                                attempts: attempt,
                                http_status: status,
                                duration_ms: elapsed_ms(started),
                            });
                            return Ok(DeliveryOutcome::Delivered {
                                batch_id: batch.batch_id.clone(),
                                attempts: attempt,
                                status,
                            });
                        }
                        StatusClass::Rejected => {
                            self.acknowledge(batch)?;
                            eprintln!(
                                "[UMB-UPLOAD] batch {} rejected with HTTP {status}; not retrying",
                                batch.batch_id
                            );
                            self.store.logger().send(ActivityEvent::BatchRejected {
                                batch_id: batch.batch_id.clone(),
                                attempts: attempt,
                                http_status: status,
                            });
                            return Ok(DeliveryOutcome::Rejected {
                                batch_id: batch.batch_id.clone(),
                                attempts: attempt,
                                status,
                            });
                        }
                        StatusClass::Transient => last_failure = format!("HTTP {status}"),
                    }
                }
                Err(TransportError::InvalidUrl(details)) => {
                    return Ok(self.defer(batch, attempt, None, format!("invalid endpoint: {details}")));
                }
                Err(err) => {
                    last_status = None;
                    last_failure = err.to_string();
                }
            }
        }

        Ok(self.defer(
            batch,
            policy.max_attempts,
            last_status,
            format!("{} attempts exhausted: {last_failure}", policy.max_attempts),
        ))
    }

    fn defer(
        &self,
        batch: &PendingBatch,
        attempts: u32,
        http_status: Option<u16>,
        reason: String,
    ) -> DeliveryOutcome {
        self.store.logger().send(ActivityEvent::BatchDeferred {
            batch_id: batch.batch_id.clone(),
            attempts,
            http_status,
            reason: reason.clone(),
        });
        DeliveryOutcome::Deferred {
            batch_id: batch.batch_id.clone(),
            attempts,
            reason,
        }
    }

    /// Advance sent by the batch's delta, record its id, and drop the pending record.
    fn acknowledge(&self, batch: &PendingBatch) -> Result<()> {
        let delta = batch.parsed_payload()?.delta();
        let mut locked = vec![keys::PENDING_BATCH, keys::LAST_ACKED_BATCH];
        locked.extend(Side::Sent.keys());

        self.store.update(&locked, |view| {
            if view.get(keys::LAST_ACKED_BATCH) == Some(batch.batch_id.as_str()) {
                return Ok((Vec::new(), ()));
            }
            let still_pending = view
                .get(keys::PENDING_BATCH)
                .and_then(|raw| PendingBatch::decode(raw).ok())
                .is_some_and(|pending| pending.batch_id == batch.batch_id);
            if !still_pending {
                return Err(BeaconError::Runtime {
                    details: format!("batch {} is no longer pending", batch.batch_id),
                });
            }

            let sent = self.store.counter_set(view, Side::Sent);
            let mut mutations = advance(&sent, &delta).to_mutations(Side::Sent);
            mutations.push(Mutation::put(keys::LAST_ACKED_BATCH, batch.batch_id.as_str()));
            mutations.push(Mutation::delete(keys::PENDING_BATCH));
            Ok((mutations, ()))
        })
    }

    fn clear_pending(&self, batch_id: &str) -> Result<()> {
        self.store.update(&[keys::PENDING_BATCH], |view| {
            let matches = view
                .get(keys::PENDING_BATCH)
                .and_then(|raw| PendingBatch::decode(raw).ok())
                .is_some_and(|pending| pending.batch_id == batch_id);
            let mutations = if matches {
                vec![Mutation::delete(keys::PENDING_BATCH)]
            } else {
                Vec::new()
            };
            Ok((mutations, ()))
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
