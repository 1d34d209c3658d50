// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job payload construction.
//!
//! Jobs are resolved against the transaction, so they always describe the
//! graph as it will be committed (after any re-parenting in the same unit of
//! work).

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::info;

use crate::error::EngineError;
use crate::model::{Scene, SceneRef, Tile, TileJob, TileRef};
use crate::persistence::StoreTransaction;
use crate::publisher::Topic;

/// Scenes loaded during one unit of work, keyed by id.
#[derive(Debug, Default)]
pub(crate) struct SceneCache {
    scenes: HashMap<i64, Scene>,
}

impl SceneCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Seed the cache with a scene already in hand (possibly just updated).
    pub(crate) fn insert(&mut self, scene: Scene) {
        self.scenes.insert(scene.id, scene);
    }

    pub(crate) async fn get(
        &mut self,
        tx: &mut dyn StoreTransaction,
        scene_id: i64,
    ) -> Result<&Scene, EngineError> {
        match self.scenes.entry(scene_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(tx.scene(scene_id).await?)),
        }
    }

    async fn tile_ref(
        &mut self,
        tx: &mut dyn StoreTransaction,
        tile: &Tile,
    ) -> Result<TileRef, EngineError> {
        let scene = self.get(tx, tile.scene_id).await?;
        Ok(TileRef::new(tile, scene))
    }
}

/// Queue the download job of a scene.
pub(crate) async fn enqueue_scene_job(
    tx: &mut dyn StoreTransaction,
    scene: &Scene,
) -> Result<(), EngineError> {
    let payload = serde_json::to_vec(&SceneRef::from(scene))?;
    tx.enqueue_job(Topic::SceneJobs, &payload).await?;

    info!(scene_id = scene.id, source_id = %scene.source_id, "Queueing scene");
    Ok(())
}

/// Queue the processing job of a tile, with its resolved previous and
/// reference tiles.
pub(crate) async fn enqueue_tile_job(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    tile: &Tile,
) -> Result<(), EngineError> {
    let previous = match tile.previous_id {
        Some(id) => {
            let previous = tx.tile(id).await?;
            Some(cache.tile_ref(tx, &previous).await?)
        }
        None => None,
    };
    let reference = match tile.reference_id {
        Some(id) => {
            let reference = tx.tile(id).await?;
            Some(cache.tile_ref(tx, &reference).await?)
        }
        None => None,
    };

    let job = TileJob {
        tile: cache.tile_ref(tx, tile).await?,
        previous,
        reference,
    };
    let payload = serde_json::to_vec(&job)?;
    tx.enqueue_job(Topic::TileJobs, &payload).await?;

    info!(
        tile_id = tile.id,
        scene = %job.tile.scene.source_id,
        tile = %tile.source_id,
        previous_id = ?tile.previous_id,
        reference_id = ?tile.reference_id,
        "Queueing tile"
    );
    Ok(())
}
