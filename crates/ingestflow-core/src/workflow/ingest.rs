// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scene ingestion.

use std::collections::{BTreeMap, BTreeSet};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::EngineError;
use crate::model::{NewScene, NewTile, SceneToIngest, TileLink, TileToIngest};
use crate::persistence::StoreTransaction;
use crate::status::Status;

use super::WorkflowEngine;
use super::jobs::enqueue_scene_job;
use super::unit_of_work::cancellable;

impl WorkflowEngine {
    /// Register a scene and its tiles, then queue the scene download.
    ///
    /// Fails with `AlreadyExists` when the AOI already holds a scene with the
    /// same source ID; callers may treat that as success.
    #[instrument(skip(self, scene, cancel), fields(scene = %scene.source_id))]
    pub async fn ingest_scene(
        &self,
        aoi: &str,
        scene: SceneToIngest,
        cancel: &CancellationToken,
    ) -> Result<i64, EngineError> {
        const OP: &str = "ingest_scene";
        validate(aoi, &scene)?;

        let _guard = cancellable(cancel, OP, async { Ok(self.lock.lock().await) }).await?;
        let mut tx = self.store.begin().await?;
        let result = cancellable(cancel, OP, insert_scene(&mut *tx, aoi, &scene)).await;
        self.settle(tx, cancel, OP, result).await
    }

    /// Ingest several scenes, skipping the ones already known.
    ///
    /// Returns the IDs of the scenes created, keyed by source ID.
    pub async fn ingest_scenes(
        &self,
        aoi: &str,
        scenes: Vec<SceneToIngest>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, i64>, EngineError> {
        let mut created = BTreeMap::new();
        for scene in scenes {
            let source_id = scene.source_id.clone();
            match self.ingest_scene(aoi, scene, cancel).await {
                Ok(id) => {
                    created.insert(source_id, id);
                }
                Err(EngineError::AlreadyExists { .. }) => {
                    debug!(aoi, scene = %source_id, "Scene already ingested, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(created)
    }
}

fn invalid(field: &str, message: impl Into<String>) -> EngineError {
    EngineError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Reject requests that do not describe a consistent scene.
fn validate(aoi: &str, scene: &SceneToIngest) -> Result<(), EngineError> {
    if scene.aoi != aoi {
        return Err(invalid(
            "aoi",
            format!("scene targets AOI '{}', not '{}'", scene.aoi, aoi),
        ));
    }
    if scene.source_id.is_empty() {
        return Err(invalid("source_id", "must not be empty"));
    }
    if scene.tiles.is_empty() {
        return Err(invalid("tiles", "scene has no tiles"));
    }

    let mappings = &scene.data.tile_mappings;
    if scene.tiles.len() != mappings.len() {
        return Err(invalid(
            "tiles",
            format!(
                "{} tiles declared but {} tile mappings",
                scene.tiles.len(),
                mappings.len()
            ),
        ));
    }
    if let Some(unmapped) = scene.tiles.keys().find(|id| !mappings.contains_key(*id)) {
        return Err(invalid(
            "tiles",
            format!("tile '{}' has no tile mapping", unmapped),
        ));
    }
    Ok(())
}

/// Links pointing at a tile of the scene being ingested.
fn local_links<'a>(scene_source_id: &str, tile: &'a TileToIngest) -> Vec<&'a TileLink> {
    [tile.previous.as_ref(), tile.reference.as_ref()]
        .into_iter()
        .flatten()
        .filter(|link| link.scene_source_id == scene_source_id)
        .collect()
}

async fn insert_scene(
    tx: &mut dyn StoreTransaction,
    aoi: &str,
    scene: &SceneToIngest,
) -> Result<i64, EngineError> {
    tx.aoi(aoi).await?;
    if tx.scene_id(aoi, &scene.source_id).await?.is_some() {
        return Err(EngineError::AlreadyExists {
            kind: "scene",
            id: scene.source_id.clone(),
        });
    }

    let scene_id = tx
        .create_scene(&NewScene {
            source_id: scene.source_id.clone(),
            aoi_id: aoi.to_string(),
            status: Status::Pending,
            attrs: scene.data.clone(),
            retry_countdown: scene.retry_count,
        })
        .await?;

    // Tiles linking to tiles of the same scene go after their targets
    let mut created: BTreeSet<&str> = BTreeSet::new();
    while created.len() < scene.tiles.len() {
        let mut progressed = false;
        for (source_id, tile) in &scene.tiles {
            if created.contains(source_id.as_str()) {
                continue;
            }
            let ready = local_links(&scene.source_id, tile)
                .iter()
                .all(|link| created.contains(link.tile_source_id.as_str()));
            if !ready {
                continue;
            }

            tx.create_tile(&NewTile {
                source_id: source_id.clone(),
                scene_id,
                aoi_id: aoi.to_string(),
                previous: tile.previous.clone(),
                reference: tile.reference.clone(),
                attrs: tile.data.clone(),
                retry_countdown: scene.retry_count,
            })
            .await?;
            created.insert(source_id.as_str());
            progressed = true;
        }
        if !progressed {
            return Err(invalid(
                "tiles",
                "tile links within the scene are cyclic or dangling",
            ));
        }
    }

    let stored = tx.scene(scene_id).await?;
    enqueue_scene_job(tx, &stored).await?;
    tx.refresh_aoi_status(aoi).await?;

    info!(
        aoi,
        scene_id,
        scene = %scene.source_id,
        tiles = scene.tiles.len(),
        "Scene ingested"
    );
    Ok(scene_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SceneAttrs, TileMapping};

    fn scene(tiles: &[&str], mappings: &[&str]) -> SceneToIngest {
        let mut data = SceneAttrs::default();
        for id in mappings {
            data.tile_mappings
                .insert(id.to_string(), TileMapping::default());
        }
        SceneToIngest {
            source_id: "S1A_1".to_string(),
            aoi: "alps".to_string(),
            retry_count: 0,
            data,
            tiles: tiles
                .iter()
                .map(|id| (id.to_string(), TileToIngest::default()))
                .collect(),
        }
    }

    #[test]
    fn test_validate_accepts_consistent_scene() {
        assert!(validate("alps", &scene(&["a", "b"], &["a", "b"])).is_ok());
    }

    #[test]
    fn test_validate_rejects_aoi_mismatch() {
        let err = validate("andes", &scene(&["a"], &["a"])).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("andes"));
    }

    #[test]
    fn test_validate_rejects_empty_and_inconsistent_tiles() {
        assert!(validate("alps", &scene(&[], &[])).is_err());
        assert!(validate("alps", &scene(&["a", "b"], &["a"])).is_err());
        assert!(validate("alps", &scene(&["a", "b"], &["a", "c"])).is_err());
    }

    #[test]
    fn test_local_links_ignore_other_scenes() {
        let tile = TileToIngest {
            previous: Some(TileLink {
                scene_source_id: "S1A_0".to_string(),
                tile_source_id: "a".to_string(),
            }),
            reference: Some(TileLink {
                scene_source_id: "S1A_1".to_string(),
                tile_source_id: "b".to_string(),
            }),
            ..TileToIngest::default()
        };
        let links = local_links("S1A_1", &tile);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].tile_source_id, "b");
    }
}
