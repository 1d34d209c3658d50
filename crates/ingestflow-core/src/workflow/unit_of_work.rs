// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unit of work boundary.
//!
//! ```text
//! begin ──▶ mutation (cancellable) ──▶ commit ──▶ flush outbox
//!                 │                      ▲
//!                 └── error / cancel ────┴──▶ rollback
//! ```
//!
//! Jobs are only published after commit has returned. A failed publication
//! leaves the jobs in the outbox and does not fail the operation.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::outbox;
use crate::persistence::StoreTransaction;

use super::WorkflowEngine;

/// Run a future unless the token is cancelled first.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    operation: &'static str,
    fut: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled { operation }),
        result = fut => result,
    }
}

impl WorkflowEngine {
    /// Commit on success, roll back on error or cancellation, then relay
    /// the outbox.
    pub(crate) async fn settle<T>(
        &self,
        tx: Box<dyn StoreTransaction>,
        cancel: &CancellationToken,
        operation: &'static str,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let result = match result {
            Ok(_) if cancel.is_cancelled() => Err(EngineError::Cancelled { operation }),
            other => other,
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(operation, error = %rollback_err, "Rollback failed");
                }
                debug!(operation, error = %err, "Unit of work rolled back");
                return Err(err);
            }
        };

        tx.commit().await?;

        match outbox::flush(self.store.as_ref(), self.publisher.as_ref(), self.batch_size).await {
            Ok(0) => {}
            Ok(published) => debug!(operation, published, "Outbox flushed"),
            Err(err) => warn!(
                operation,
                error = %err,
                "Jobs committed but not published, they stay in the outbox"
            ),
        }

        Ok(value)
    }
}
