// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow engine entry points.
//!
//! Every mutation runs as one unit of work and is serialized by a single
//! engine-wide lock, so graph repairs never interleave. Reads go straight to
//! the store (see [`queries`](self)).

mod dot;
mod ingest;
mod jobs;
mod queries;
mod scenes;
mod tiles;
mod unit_of_work;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::model::{ResultKind, SceneAttrs, TileAttrs, TileFilter, WorkerResult};
use crate::outbox;
use crate::persistence::StateStore;
use crate::publisher::Publisher;
use crate::status::Status;

use self::unit_of_work::cancellable;

/// Default number of outbox rows published per batch.
pub const DEFAULT_OUTBOX_BATCH_SIZE: i64 = 100;

/// Counts reported by [`WorkflowEngine::retry_aoi`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Scenes put back to PENDING.
    pub scenes: usize,
    /// Tiles put back to PENDING.
    pub tiles: usize,
}

/// Tracks scenes and tiles through their lifecycle and publishes the jobs
/// that become runnable.
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    publisher: Arc<dyn Publisher>,
    lock: Mutex<()>,
    batch_size: i64,
}

impl WorkflowEngine {
    /// Create an engine over a store and a publisher.
    pub fn new(store: Arc<dyn StateStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            lock: Mutex::new(()),
            batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
        }
    }

    /// Override the number of outbox rows published per batch.
    pub fn with_outbox_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    // ========================================================================
    // Status updates
    // ========================================================================

    /// Request a tile status change.
    ///
    /// Returns `Ok(false)` when the transition is rejected (duplicate or
    /// stale request). Unknown tiles are reported as `TileNotFound`.
    #[instrument(skip(self, message, cancel))]
    pub async fn update_tile_status(
        &self,
        id: i64,
        status: Status,
        message: Option<&str>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        const OP: &str = "update_tile_status";
        let _guard = cancellable(cancel, OP, async { Ok(self.lock.lock().await) }).await?;

        let mut tx = self.store.begin().await?;
        let result = cancellable(
            cancel,
            OP,
            tiles::update_status(&mut *tx, id, status, message, force),
        )
        .await;
        self.settle(tx, cancel, OP, result).await
    }

    /// Request a scene status change.
    ///
    /// Returns `Ok(false)` when the transition is rejected (duplicate or
    /// stale request). Unknown scenes are reported as `SceneNotFound`.
    #[instrument(skip(self, message, cancel))]
    pub async fn update_scene_status(
        &self,
        id: i64,
        status: Status,
        message: Option<&str>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        const OP: &str = "update_scene_status";
        let _guard = cancellable(cancel, OP, async { Ok(self.lock.lock().await) }).await?;

        let mut tx = self.store.begin().await?;
        let result = cancellable(
            cancel,
            OP,
            scenes::update_status(&mut *tx, id, status, message, force),
        )
        .await;
        self.settle(tx, cancel, OP, result).await
    }

    /// Route a worker result to the tile or scene update.
    pub async fn handle_result(
        &self,
        result: &WorkerResult,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let message = Some(result.message.as_str());
        match result.kind {
            ResultKind::Tile => {
                self.update_tile_status(result.id, result.status, message, false, cancel)
                    .await
            }
            ResultKind::Scene => {
                self.update_scene_status(result.id, result.status, message, false, cancel)
                    .await
            }
        }
    }

    // ========================================================================
    // AOIs and attributes
    // ========================================================================

    /// Create an AOI. A second creation fails with `AlreadyExists`.
    #[instrument(skip(self))]
    pub async fn create_aoi(&self, aoi: &str) -> Result<(), EngineError> {
        if aoi.trim().is_empty() {
            return Err(EngineError::ValidationError {
                field: "aoi".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let _guard = self.lock.lock().await;
        self.store.create_aoi(aoi).await?;
        info!(aoi, "AOI created");
        Ok(())
    }

    /// Replace the attribute bag of a scene.
    #[instrument(skip(self, attrs, cancel))]
    pub async fn update_scene_attrs(
        &self,
        id: i64,
        attrs: &SceneAttrs,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        const OP: &str = "update_scene_attrs";
        let _guard = cancellable(cancel, OP, async { Ok(self.lock.lock().await) }).await?;

        let mut tx = self.store.begin().await?;
        let result = cancellable(cancel, OP, tx.update_scene_attrs(id, attrs)).await;
        self.settle(tx, cancel, OP, result).await
    }

    /// Replace the attribute bag of a tile.
    #[instrument(skip(self, attrs, cancel))]
    pub async fn update_tile_attrs(
        &self,
        id: i64,
        attrs: &TileAttrs,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        const OP: &str = "update_tile_attrs";
        let _guard = cancellable(cancel, OP, async { Ok(self.lock.lock().await) }).await?;

        let mut tx = self.store.begin().await?;
        let result = cancellable(cancel, OP, tx.update_tile_attrs(id, attrs)).await;
        self.settle(tx, cancel, OP, result).await
    }

    /// Retry the scenes and tiles of an AOI.
    ///
    /// Without `force`, every RETRY scene and tile is requeued. With `force`,
    /// RETRY and PENDING scenes are requeued, then the RETRY and PENDING
    /// tiles of the scenes that were DONE when the sweep started. Each entity
    /// is its own unit of work; the sweep continues past errors and returns
    /// the first one.
    #[instrument(skip(self, cancel))]
    pub async fn retry_aoi(
        &self,
        aoi: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RetrySummary, EngineError> {
        self.store.aoi(aoi).await?;

        let mut summary = RetrySummary::default();
        let mut first_error = None;
        let retryable = |status: Status| {
            status == Status::Retry || (force && status == Status::Pending)
        };

        let scene_list = self.store.scenes(aoi, None).await?;
        for scene in scene_list.iter().filter(|s| retryable(s.status)) {
            match self
                .update_scene_status(scene.id, Status::Pending, Some(""), force, cancel)
                .await
            {
                Ok(true) => summary.scenes += 1,
                Ok(false) => {}
                Err(err @ EngineError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(scene_id = scene.id, error = %err, "Scene retry failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        let tile_list = if force {
            let mut tile_list = Vec::new();
            for scene in scene_list.iter().filter(|s| s.status == Status::Done) {
                let filter = TileFilter {
                    scene_id: Some(scene.id),
                    ..TileFilter::default()
                };
                match self.store.tiles(&filter).await {
                    Ok(found) => tile_list.extend(found),
                    Err(err) => {
                        warn!(scene_id = scene.id, error = %err, "Listing scene tiles failed");
                        first_error.get_or_insert(err);
                    }
                }
            }
            tile_list
        } else {
            let filter = TileFilter {
                aoi: Some(aoi.to_string()),
                status: Some(Status::Retry),
                ..TileFilter::default()
            };
            self.store.tiles(&filter).await?
        };

        for tile in tile_list.iter().filter(|t| retryable(t.status)) {
            match self
                .update_tile_status(tile.id, Status::Pending, Some(""), force, cancel)
                .await
            {
                Ok(true) => summary.tiles += 1,
                Ok(false) => {}
                Err(err @ EngineError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(tile_id = tile.id, error = %err, "Tile retry failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        info!(
            aoi,
            scenes = summary.scenes,
            tiles = summary.tiles,
            "AOI retry sweep done"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Publish jobs left in the outbox by an earlier publication failure.
    pub async fn flush_outbox(&self) -> Result<usize, EngineError> {
        let _guard = self.lock.lock().await;
        outbox::flush(self.store.as_ref(), self.publisher.as_ref(), self.batch_size).await
    }
}
