// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ingestflow-core integration tests.
//!
//! Provides TestContext wiring a SQLite store, a recording publisher and the
//! engine, builders for ingestion requests, and FaultStore for injecting
//! store faults.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ingestflow_core::model::{
    Aoi, NewScene, NewTile, Scene, SceneAttrs, StatusCounts, StatusUpdate, TileAttrs, TileJob,
    TileRef,
};
use ingestflow_core::persistence::OutboxJob;
use ingestflow_core::{
    EngineError, RecordingPublisher, SceneToIngest, SqliteStore, StateStore, Status,
    StoreTransaction, Tile, TileFilter, TileLink, TileMapping, TileToIngest, Topic,
    WorkflowEngine,
};

pub const AOI: &str = "alps";

/// Test context that manages the store, publisher and engine.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub engine: Arc<WorkflowEngine>,
    pub cancel: CancellationToken,
}

impl TestContext {
    /// Fresh in-memory database with the default AOI created.
    pub async fn new() -> Self {
        let store = SqliteStore::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to open in-memory store");
        Self::with_store(store).await
    }

    /// Same wiring over an existing store, e.g. a file-backed one.
    pub async fn with_store(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = Arc::new(WorkflowEngine::new(store.clone(), publisher.clone()));

        engine.create_aoi(AOI).await.expect("Failed to create AOI");

        Self {
            store,
            publisher,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    /// Ingest a scene into the AOI it names.
    pub async fn ingest(&self, scene: SceneToIngest) -> i64 {
        let aoi = scene.aoi.clone();
        self.engine
            .ingest_scene(&aoi, scene, &self.cancel)
            .await
            .expect("Failed to ingest scene")
    }

    /// Store id of a tile given its scene id and source id.
    pub async fn tile_id(&self, scene_id: i64, source_id: &str) -> i64 {
        let filter = TileFilter {
            scene_id: Some(scene_id),
            ..TileFilter::default()
        };
        self.engine
            .tiles(&filter)
            .await
            .expect("Failed to list tiles")
            .into_iter()
            .find(|t| t.source_id == source_id)
            .unwrap_or_else(|| panic!("tile {} not found in scene {}", source_id, scene_id))
            .id
    }

    pub async fn tile(&self, id: i64) -> Tile {
        self.engine.tile(id).await.expect("Failed to load tile")
    }

    pub async fn tile_status(&self, id: i64) -> Status {
        self.tile(id).await.status
    }

    pub async fn scene_status(&self, id: i64) -> Status {
        self.engine
            .scene(id)
            .await
            .expect("Failed to load scene")
            .status
    }

    pub async fn aoi_status(&self) -> Status {
        self.engine.aoi(AOI).await.expect("Failed to load AOI").status
    }

    /// Report a scene result the way the download worker does.
    pub async fn scene_result(&self, id: i64, status: Status) -> bool {
        self.engine
            .update_scene_status(id, status, Some(""), false, &self.cancel)
            .await
            .expect("Scene update failed")
    }

    /// Report a tile result the way the processing worker does.
    pub async fn tile_result(&self, id: i64, status: Status) -> bool {
        self.engine
            .update_tile_status(id, status, Some(""), false, &self.cancel)
            .await
            .expect("Tile update failed")
    }

    pub fn tile_jobs(&self) -> Vec<TileJob> {
        self.publisher
            .tile_jobs()
            .expect("Failed to decode tile jobs")
    }

    /// Ids of the tiles that received a job, in publication order.
    pub fn tile_job_ids(&self) -> Vec<i64> {
        self.tile_jobs().iter().map(|j| j.tile.id).collect()
    }
}

/// Builder for scene ingestion requests.
pub struct SceneBuilder {
    scene: SceneToIngest,
}

/// Start a scene request targeting the default AOI.
pub fn scene(source_id: &str) -> SceneBuilder {
    SceneBuilder {
        scene: SceneToIngest {
            source_id: source_id.to_string(),
            aoi: AOI.to_string(),
            retry_count: 0,
            data: Default::default(),
            tiles: Default::default(),
        },
    }
}

fn link(target: Option<(&str, &str)>) -> Option<TileLink> {
    target.map(|(scene, tile)| TileLink {
        scene_source_id: scene.to_string(),
        tile_source_id: tile.to_string(),
    })
}

impl SceneBuilder {
    pub fn retries(mut self, retry_count: i32) -> Self {
        self.scene.retry_count = retry_count;
        self
    }

    /// Add a tile with no links.
    pub fn tile(self, source_id: &str) -> Self {
        self.tile_with(source_id, None, None)
    }

    /// Add a tile following `(scene, tile)`.
    pub fn tile_after(self, source_id: &str, previous: (&str, &str)) -> Self {
        self.tile_with(source_id, Some(previous), None)
    }

    pub fn tile_with(
        mut self,
        source_id: &str,
        previous: Option<(&str, &str)>,
        reference: Option<(&str, &str)>,
    ) -> Self {
        let tile_nr = self.scene.tiles.len() as i32 + 1;
        self.scene.data.tile_mappings.insert(
            source_id.to_string(),
            TileMapping {
                swath_id: "IW1".to_string(),
                tile_nr,
            },
        );
        self.scene.tiles.insert(
            source_id.to_string(),
            TileToIngest {
                previous: link(previous),
                reference: link(reference),
                data: Default::default(),
            },
        );
        self
    }

    pub fn build(self) -> SceneToIngest {
        self.scene
    }
}

/// SQLite store with injectable faults.
///
/// - `cancel_on_root_unblock`: transactions cancel the token right after a
///   scene unblocks its chain heads, in the middle of the finish cascade.
/// - `fail_tile_listing`: listing the tiles of that scene fails.
pub struct FaultStore {
    inner: Arc<SqliteStore>,
    cancel_on_root_unblock: Option<CancellationToken>,
    failing_tile_scene: AtomicI64,
}

impl FaultStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            cancel_on_root_unblock: None,
            failing_tile_scene: AtomicI64::new(0),
        }
    }

    pub fn cancel_on_root_unblock(mut self, cancel: CancellationToken) -> Self {
        self.cancel_on_root_unblock = Some(cancel);
        self
    }

    pub fn fail_tile_listing(&self, scene_id: i64) {
        self.failing_tile_scene.store(scene_id, Ordering::SeqCst);
    }
}

struct FaultTransaction {
    inner: Box<dyn StoreTransaction>,
    cancel_on_root_unblock: Option<CancellationToken>,
}

#[async_trait]
impl StateStore for FaultStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, EngineError> {
        Ok(Box::new(FaultTransaction {
            inner: self.inner.begin().await?,
            cancel_on_root_unblock: self.cancel_on_root_unblock.clone(),
        }))
    }

    async fn create_aoi(&self, aoi: &str) -> Result<(), EngineError> {
        self.inner.create_aoi(aoi).await
    }

    async fn aoi(&self, aoi: &str) -> Result<Aoi, EngineError> {
        self.inner.aoi(aoi).await
    }

    async fn aois(&self, pattern: Option<&str>) -> Result<Vec<Aoi>, EngineError> {
        self.inner.aois(pattern).await
    }

    async fn scene(&self, id: i64) -> Result<Scene, EngineError> {
        self.inner.scene(id).await
    }

    async fn scenes(&self, aoi: &str, status: Option<Status>) -> Result<Vec<Scene>, EngineError> {
        self.inner.scenes(aoi, status).await
    }

    async fn scene_id(&self, aoi: &str, source_id: &str) -> Result<Option<i64>, EngineError> {
        self.inner.scene_id(aoi, source_id).await
    }

    async fn scene_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError> {
        self.inner.scene_status_counts(aoi).await
    }

    async fn tile(&self, id: i64) -> Result<Tile, EngineError> {
        self.inner.tile(id).await
    }

    async fn tiles(&self, filter: &TileFilter) -> Result<Vec<Tile>, EngineError> {
        let failing = self.failing_tile_scene.load(Ordering::SeqCst);
        if failing != 0 && filter.scene_id == Some(failing) {
            return Err(EngineError::DatabaseError {
                operation: "list_tiles".to_string(),
                details: "injected fault".to_string(),
            });
        }
        self.inner.tiles(filter).await
    }

    async fn tile_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError> {
        self.inner.tile_status_counts(aoi).await
    }

    async fn root_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError> {
        self.inner.root_tiles(aoi).await
    }

    async fn leaf_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError> {
        self.inner.leaf_tiles(aoi).await
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<OutboxJob>, EngineError> {
        self.inner.pending_jobs(limit).await
    }

    async fn ack_jobs(&self, ids: &[i64]) -> Result<(), EngineError> {
        self.inner.ack_jobs(ids).await
    }
}

#[async_trait]
impl StoreTransaction for FaultTransaction {
    async fn aoi(&mut self, aoi: &str) -> Result<Aoi, EngineError> {
        self.inner.aoi(aoi).await
    }

    async fn scene(&mut self, id: i64) -> Result<Scene, EngineError> {
        self.inner.scene(id).await
    }

    async fn scene_id(&mut self, aoi: &str, source_id: &str) -> Result<Option<i64>, EngineError> {
        self.inner.scene_id(aoi, source_id).await
    }

    async fn create_scene(&mut self, scene: &NewScene) -> Result<i64, EngineError> {
        self.inner.create_scene(scene).await
    }

    async fn update_scene(&mut self, id: i64, update: &StatusUpdate) -> Result<(), EngineError> {
        self.inner.update_scene(id, update).await
    }

    async fn update_scene_attrs(
        &mut self,
        id: i64,
        attrs: &SceneAttrs,
    ) -> Result<(), EngineError> {
        self.inner.update_scene_attrs(id, attrs).await
    }

    async fn tile(&mut self, id: i64) -> Result<Tile, EngineError> {
        self.inner.tile(id).await
    }

    async fn scene_tiles(&mut self, scene_id: i64) -> Result<Vec<Tile>, EngineError> {
        self.inner.scene_tiles(scene_id).await
    }

    async fn create_tile(&mut self, tile: &NewTile) -> Result<i64, EngineError> {
        self.inner.create_tile(tile).await
    }

    async fn update_tile(&mut self, id: i64, update: &StatusUpdate) -> Result<(), EngineError> {
        self.inner.update_tile(id, update).await
    }

    async fn update_tile_attrs(&mut self, id: i64, attrs: &TileAttrs) -> Result<(), EngineError> {
        self.inner.update_tile_attrs(id, attrs).await
    }

    async fn set_tiles_status(&mut self, ids: &[i64], status: Status) -> Result<(), EngineError> {
        self.inner.set_tiles_status(ids, status).await
    }

    async fn unblock_next_tiles(&mut self, previous_id: i64) -> Result<Vec<Tile>, EngineError> {
        self.inner.unblock_next_tiles(previous_id).await
    }

    async fn unblock_scene_tiles(&mut self, scene_id: i64) -> Result<Vec<Tile>, EngineError> {
        self.inner.unblock_scene_tiles(scene_id).await
    }

    async fn unblock_scene_root_tiles(
        &mut self,
        scene_id: i64,
    ) -> Result<Vec<Tile>, EngineError> {
        let heads = self.inner.unblock_scene_root_tiles(scene_id).await;
        if let Some(cancel) = &self.cancel_on_root_unblock {
            cancel.cancel();
        }
        heads
    }

    async fn reparent_next_tiles(
        &mut self,
        old_previous: i64,
        new_previous: Option<i64>,
    ) -> Result<Vec<i64>, EngineError> {
        self.inner.reparent_next_tiles(old_previous, new_previous).await
    }

    async fn referencing_tiles(&mut self, reference_id: i64) -> Result<Vec<Tile>, EngineError> {
        self.inner.referencing_tiles(reference_id).await
    }

    async fn reassign_reference(
        &mut self,
        old_reference: i64,
        new_reference: i64,
    ) -> Result<(), EngineError> {
        self.inner.reassign_reference(old_reference, new_reference).await
    }

    async fn refresh_aoi_status(&mut self, aoi: &str) -> Result<Status, EngineError> {
        self.inner.refresh_aoi_status(aoi).await
    }

    async fn enqueue_job(&mut self, topic: Topic, payload: &[u8]) -> Result<(), EngineError> {
        self.inner.enqueue_job(topic, payload).await
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let this = *self;
        this.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        let this = *self;
        this.inner.rollback().await
    }
}
