// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for ingestflow-core.
//!
//! [`StateStore`] serves reads outside of any transaction and opens units of
//! work. [`StoreTransaction`] carries every mutation; nothing it writes is
//! visible until [`StoreTransaction::commit`] returns.
//!
//! Graph maintenance (`unblock_*`, `reparent_next_tiles`, `reassign_reference`)
//! is expressed as set-based updates so a cascade touches each row once.

pub mod sqlite;

pub use self::sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::model::{
    Aoi, NewScene, NewTile, Scene, SceneAttrs, StatusCounts, StatusUpdate, Tile, TileAttrs,
    TileFilter, TileRef,
};
use crate::publisher::Topic;
use crate::status::Status;

/// Job waiting in the outbox for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxJob {
    /// Outbox row id; publication follows id order.
    pub id: i64,
    /// Destination topic.
    pub topic: Topic,
    /// Serialized job.
    pub payload: Vec<u8>,
}

/// Read access and transaction factory.
#[allow(missing_docs)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Open a unit of work.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, EngineError>;

    /// Create an AOI in status NEW. Fails with `AlreadyExists` on duplicates.
    async fn create_aoi(&self, aoi: &str) -> Result<(), EngineError>;

    async fn aoi(&self, aoi: &str) -> Result<Aoi, EngineError>;

    /// List AOIs, optionally filtered with a glob pattern (`*`, `?`).
    async fn aois(&self, pattern: Option<&str>) -> Result<Vec<Aoi>, EngineError>;

    async fn scene(&self, id: i64) -> Result<Scene, EngineError>;

    async fn scenes(&self, aoi: &str, status: Option<Status>) -> Result<Vec<Scene>, EngineError>;

    /// Look up a scene by its source ID within an AOI.
    async fn scene_id(&self, aoi: &str, source_id: &str) -> Result<Option<i64>, EngineError>;

    async fn scene_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError>;

    async fn tile(&self, id: i64) -> Result<Tile, EngineError>;

    async fn tiles(&self, filter: &TileFilter) -> Result<Vec<Tile>, EngineError>;

    async fn tile_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError>;

    /// Non-failed tiles of the AOI with neither previous nor reference.
    async fn root_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError>;

    /// Non-failed tiles of the AOI that no tile points to as previous.
    async fn leaf_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError>;

    /// Oldest outbox entries, in id order.
    async fn pending_jobs(&self, limit: i64) -> Result<Vec<OutboxJob>, EngineError>;

    /// Remove published outbox entries.
    async fn ack_jobs(&self, ids: &[i64]) -> Result<(), EngineError>;
}

/// Mutations scoped to one unit of work.
///
/// Dropping a transaction without committing rolls it back.
#[allow(missing_docs)]
#[async_trait]
pub trait StoreTransaction: Send {
    async fn aoi(&mut self, aoi: &str) -> Result<Aoi, EngineError>;

    async fn scene(&mut self, id: i64) -> Result<Scene, EngineError>;

    async fn scene_id(&mut self, aoi: &str, source_id: &str) -> Result<Option<i64>, EngineError>;

    async fn create_scene(&mut self, scene: &NewScene) -> Result<i64, EngineError>;

    async fn update_scene(&mut self, id: i64, update: &StatusUpdate) -> Result<(), EngineError>;

    async fn update_scene_attrs(&mut self, id: i64, attrs: &SceneAttrs)
    -> Result<(), EngineError>;

    async fn tile(&mut self, id: i64) -> Result<Tile, EngineError>;

    /// All tiles of a scene, in id order.
    async fn scene_tiles(&mut self, scene_id: i64) -> Result<Vec<Tile>, EngineError>;

    /// Insert a tile, resolving its links by source IDs within the AOI.
    ///
    /// A link naming a missing or FAILED tile is a `ValidationError`.
    async fn create_tile(&mut self, tile: &NewTile) -> Result<i64, EngineError>;

    async fn update_tile(&mut self, id: i64, update: &StatusUpdate) -> Result<(), EngineError>;

    async fn update_tile_attrs(&mut self, id: i64, attrs: &TileAttrs) -> Result<(), EngineError>;

    async fn set_tiles_status(&mut self, ids: &[i64], status: Status) -> Result<(), EngineError>;

    /// NEW tiles whose previous is `previous_id` and whose scene is DONE
    /// become PENDING. Returns them in id order.
    async fn unblock_next_tiles(&mut self, previous_id: i64) -> Result<Vec<Tile>, EngineError>;

    /// NEW tiles of the scene whose previous is DONE become PENDING.
    async fn unblock_scene_tiles(&mut self, scene_id: i64) -> Result<Vec<Tile>, EngineError>;

    /// NEW tiles of the scene without a previous become PENDING.
    async fn unblock_scene_root_tiles(&mut self, scene_id: i64)
    -> Result<Vec<Tile>, EngineError>;

    /// Point every tile following `old_previous` at `new_previous`.
    /// Returns the re-parented tile ids in ascending order.
    async fn reparent_next_tiles(
        &mut self,
        old_previous: i64,
        new_previous: Option<i64>,
    ) -> Result<Vec<i64>, EngineError>;

    /// Tiles whose reference is `reference_id`, in id order.
    async fn referencing_tiles(&mut self, reference_id: i64) -> Result<Vec<Tile>, EngineError>;

    /// Tiles referencing `old_reference` now reference `new_reference`.
    /// The new reference itself becomes a baseline (reference cleared).
    async fn reassign_reference(
        &mut self,
        old_reference: i64,
        new_reference: i64,
    ) -> Result<(), EngineError>;

    /// Recompute and persist the AOI aggregate status.
    async fn refresh_aoi_status(&mut self, aoi: &str) -> Result<Status, EngineError>;

    /// Append a job to the outbox.
    async fn enqueue_job(&mut self, topic: Topic, payload: &[u8]) -> Result<(), EngineError>;

    async fn commit(self: Box<Self>) -> Result<(), EngineError>;

    async fn rollback(self: Box<Self>) -> Result<(), EngineError>;
}

/// Reduce statuses with priority RETRY > PENDING > NEW > DONE > FAILED.
pub(crate) fn aggregate_status(counts: &StatusCounts) -> Option<Status> {
    Status::ALL
        .into_iter()
        .filter(|s| counts.get(*s) > 0)
        .max_by_key(|s| s.aggregate_rank())
}
