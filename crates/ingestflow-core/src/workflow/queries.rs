// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only views. These do not take the engine lock.

use crate::error::EngineError;
use crate::model::{Aoi, Scene, StatusCounts, Tile, TileFilter, TileRef};
use crate::status::Status;

use super::WorkflowEngine;
use super::dot;

impl WorkflowEngine {
    /// Look up an AOI.
    pub async fn aoi(&self, aoi: &str) -> Result<Aoi, EngineError> {
        self.store.aoi(aoi).await
    }

    /// List AOIs, optionally matching a glob pattern.
    pub async fn aois(&self, pattern: Option<&str>) -> Result<Vec<Aoi>, EngineError> {
        self.store.aois(pattern).await
    }

    /// Look up a scene.
    pub async fn scene(&self, id: i64) -> Result<Scene, EngineError> {
        self.store.scene(id).await
    }

    /// Scenes of an AOI, optionally restricted to one status.
    pub async fn scenes(&self, aoi: &str, status: Option<Status>) -> Result<Vec<Scene>, EngineError> {
        self.store.scenes(aoi, status).await
    }

    /// Look up a tile.
    pub async fn tile(&self, id: i64) -> Result<Tile, EngineError> {
        self.store.tile(id).await
    }

    /// List tiles.
    pub async fn tiles(&self, filter: &TileFilter) -> Result<Vec<Tile>, EngineError> {
        self.store.tiles(filter).await
    }

    /// Scene counts per status.
    pub async fn scene_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError> {
        self.store.scene_status_counts(aoi).await
    }

    /// Tile counts per status.
    pub async fn tile_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError> {
        self.store.tile_status_counts(aoi).await
    }

    /// Tiles of the AOI with neither previous nor reference.
    pub async fn root_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError> {
        self.store.root_tiles(aoi).await
    }

    /// Tiles of the AOI no other tile follows.
    pub async fn leaf_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError> {
        self.store.leaf_tiles(aoi).await
    }

    /// Render the AOI dependency graph in Graphviz DOT.
    pub async fn render_dot(&self, aoi: &str) -> Result<String, EngineError> {
        self.store.aoi(aoi).await?;
        let scenes = self.store.scenes(aoi, None).await?;
        let filter = TileFilter {
            aoi: Some(aoi.to_string()),
            ..TileFilter::default()
        };
        let tiles = self.store.tiles(&filter).await?;
        Ok(dot::render(aoi, &scenes, &tiles))
    }
}
