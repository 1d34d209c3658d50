// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker result consumer.
//!
//! Drains worker results from a channel and applies them through the engine.
//! Transient failures are redelivered a bounded number of times; every other
//! failure is logged and the result dropped. A timer relays jobs left in the
//! outbox by failed publications.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::model::WorkerResult;
use crate::workflow::WorkflowEngine;

/// Result consumer configuration.
#[derive(Debug, Clone)]
pub struct ResultConsumerConfig {
    /// Attempts for a result failing with a transient error
    pub max_redeliveries: u32,
    /// Delay between those attempts
    pub redelivery_delay: Duration,
    /// How often to relay the outbox
    pub outbox_poll_interval: Duration,
}

impl Default for ResultConsumerConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            redelivery_delay: Duration::from_millis(500),
            outbox_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Consumer that runs as a background task.
pub struct ResultConsumer {
    engine: Arc<WorkflowEngine>,
    config: ResultConsumerConfig,
}

impl ResultConsumer {
    /// Create a consumer driving the given engine.
    pub fn new(engine: Arc<WorkflowEngine>, config: ResultConsumerConfig) -> Self {
        Self { engine, config }
    }

    /// Run until the channel closes or `shutdown` is cancelled.
    pub async fn run(self, mut results: mpsc::Receiver<WorkerResult>, shutdown: CancellationToken) {
        info!(
            max_redeliveries = self.config.max_redeliveries,
            outbox_poll_interval_ms = self.config.outbox_poll_interval.as_millis() as u64,
            "Result consumer started"
        );

        let mut outbox_tick = tokio::time::interval(self.config.outbox_poll_interval);
        outbox_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Result consumer shutting down");
                    break;
                }
                received = results.recv() => {
                    let Some(result) = received else {
                        info!("Result channel closed");
                        break;
                    };
                    self.deliver(&result, &shutdown).await;
                }
                _ = outbox_tick.tick() => {
                    match self.engine.flush_outbox().await {
                        Ok(0) => {}
                        Ok(published) => info!(published, "Relayed outbox jobs"),
                        Err(e) => warn!(error = %e, "Failed to relay outbox"),
                    }
                }
            }
        }

        // Last chance for jobs committed but not yet published
        if let Err(e) = self.engine.flush_outbox().await {
            warn!(error = %e, "Outbox not empty at shutdown");
        }
    }

    /// Apply one result, redelivering it on transient failures.
    async fn deliver(&self, result: &WorkerResult, shutdown: &CancellationToken) {
        let mut attempt = 1;
        loop {
            match self.engine.handle_result(result, shutdown).await {
                Ok(applied) => {
                    debug!(kind = ?result.kind, id = result.id, applied, "Result handled");
                    return;
                }
                Err(EngineError::Cancelled { .. }) => {
                    warn!(kind = ?result.kind, id = result.id, "Result dropped at shutdown");
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_redeliveries => {
                    warn!(
                        kind = ?result.kind,
                        id = result.id,
                        attempt,
                        error = %e,
                        "Transient failure, redelivering result"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.redelivery_delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        kind = ?result.kind,
                        id = result.id,
                        status = %result.status,
                        error_code = e.error_code(),
                        error = %e,
                        "Failed to handle result"
                    );
                    return;
                }
            }
        }
    }
}
