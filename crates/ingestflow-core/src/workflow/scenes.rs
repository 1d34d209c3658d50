// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scene cascades: finish (unblock tiles), retry, requeue and fail.

use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::model::{Scene, StatusUpdate};
use crate::persistence::StoreTransaction;
use crate::status::{Status, Transition};

use super::jobs::{SceneCache, enqueue_scene_job, enqueue_tile_job};
use super::tiles;

/// Apply a requested status change to a scene.
///
/// Returns `false` when the transition is rejected; nothing is written then.
pub(crate) async fn update_status(
    tx: &mut dyn StoreTransaction,
    id: i64,
    requested: Status,
    message: Option<&str>,
    force: bool,
) -> Result<bool, EngineError> {
    let scene = tx.scene(id).await?;

    info!(
        scene = %scene.source_id,
        from = %scene.status,
        to = %requested,
        force,
        "Update scene status"
    );

    let Some(transition) = scene.status.transition_to(requested, force) else {
        if scene.status == requested {
            warn!(scene_id = id, status = %requested, "Scene status already set");
        } else {
            error!(scene_id = id, from = %scene.status, to = %requested, "Cannot update scene status");
        }
        return Ok(false);
    };

    let mut cache = SceneCache::new();
    match transition {
        Transition::Finish => finish(tx, &mut cache, scene.clone(), message).await?,
        Transition::Retry => retry(tx, &scene, message).await?,
        Transition::Requeue => requeue(tx, &scene, message).await?,
        Transition::Fail => fail(tx, &mut cache, &scene, message).await?,
        Transition::Overwrite(status) => {
            tx.update_scene(id, &status_update(status, message)).await?
        }
    }

    let aoi_status = tx.refresh_aoi_status(&scene.aoi_id).await?;
    debug!(aoi = %scene.aoi_id, status = %aoi_status, "AOI status refreshed");
    Ok(true)
}

fn status_update(status: Status, message: Option<&str>) -> StatusUpdate {
    let update = StatusUpdate::to(status);
    match message {
        Some(message) => update.with_message(message),
        None => update,
    }
}

/// Mark the scene DONE and start its runnable tiles.
///
/// Chain heads (no previous) start right away; the other tiles start when
/// their previous tile is already DONE.
async fn finish(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    mut scene: Scene,
    message: Option<&str>,
) -> Result<(), EngineError> {
    tx.update_scene(scene.id, &status_update(Status::Done, message))
        .await?;
    scene.status = Status::Done;
    let scene_id = scene.id;
    cache.insert(scene);

    let heads = tx.unblock_scene_root_tiles(scene_id).await?;
    for tile in &heads {
        enqueue_tile_job(tx, cache, tile).await?;
    }

    let followers = tx.unblock_scene_tiles(scene_id).await?;
    for tile in &followers {
        enqueue_tile_job(tx, cache, tile).await?;
    }

    debug!(
        scene_id,
        heads = heads.len(),
        followers = followers.len(),
        "Scene finished"
    );
    Ok(())
}

async fn retry(
    tx: &mut dyn StoreTransaction,
    scene: &Scene,
    message: Option<&str>,
) -> Result<(), EngineError> {
    if scene.retry_countdown > 0 {
        tx.update_scene(
            scene.id,
            &status_update(Status::Pending, message).consuming_retry(),
        )
        .await?;
        info!(
            scene_id = scene.id,
            remaining = scene.retry_countdown - 1,
            "Retrying scene automatically"
        );
        enqueue_scene_job(tx, scene).await
    } else {
        warn!(scene_id = scene.id, "Scene retry budget exhausted");
        tx.update_scene(scene.id, &status_update(Status::Retry, message))
            .await
    }
}

async fn requeue(
    tx: &mut dyn StoreTransaction,
    scene: &Scene,
    message: Option<&str>,
) -> Result<(), EngineError> {
    tx.update_scene(scene.id, &status_update(Status::Pending, message))
        .await?;
    info!(scene_id = scene.id, "Retrying scene");
    enqueue_scene_job(tx, scene).await
}

/// Mark the scene FAILED and fail every one of its tiles.
///
/// A scene can only fail before any of its tiles has started.
async fn fail(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    scene: &Scene,
    message: Option<&str>,
) -> Result<(), EngineError> {
    let scene_tiles = tx.scene_tiles(scene.id).await?;
    if let Some(started) = scene_tiles.iter().find(|t| t.status != Status::New) {
        return Err(EngineError::invariant(
            "fail_scene",
            format!(
                "scene {}: tile {} is {}",
                scene.id, started.id, started.status
            ),
        ));
    }

    tx.update_scene(scene.id, &status_update(Status::Failed, message))
        .await?;
    let mut failed = scene.clone();
    failed.status = Status::Failed;
    cache.insert(failed);

    for tile in &scene_tiles {
        tiles::fail(tx, cache, tile.id, None).await?;
    }

    info!(scene_id = scene.id, tiles = scene_tiles.len(), "Scene failed");
    Ok(())
}
