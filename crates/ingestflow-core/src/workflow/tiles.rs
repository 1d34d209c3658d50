// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tile cascades: finish, retry, requeue and fail (graph repair).

use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::model::{StatusUpdate, Tile};
use crate::persistence::StoreTransaction;
use crate::status::{Status, Transition};

use super::jobs::{SceneCache, enqueue_tile_job};

/// Apply a requested status change to a tile.
///
/// Returns `false` when the transition is rejected; nothing is written then.
pub(crate) async fn update_status(
    tx: &mut dyn StoreTransaction,
    id: i64,
    requested: Status,
    message: Option<&str>,
    force: bool,
) -> Result<bool, EngineError> {
    let tile = tx.tile(id).await?;
    let mut cache = SceneCache::new();
    let scene = cache.get(tx, tile.scene_id).await?.clone();

    info!(
        scene = %scene.source_id,
        tile = %tile.source_id,
        from = %tile.status,
        to = %requested,
        force,
        "Update tile status"
    );

    let Some(transition) = tile.status.transition_to(requested, force) else {
        if tile.status == requested {
            warn!(tile_id = id, status = %requested, "Tile status already set");
        } else {
            error!(tile_id = id, from = %tile.status, to = %requested, "Cannot update tile status");
        }
        return Ok(false);
    };

    match transition {
        Transition::Finish => finish(tx, &mut cache, &tile, message).await?,
        Transition::Retry => retry(tx, &mut cache, &tile, message).await?,
        Transition::Requeue => {
            requeue(tx, &mut cache, &tile, scene.status, message, force).await?
        }
        Transition::Fail => fail(tx, &mut cache, tile.id, message).await?,
        Transition::Overwrite(status) => {
            tx.update_tile(id, &status_update(status, message)).await?
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

/// Mark the tile DONE and start every tile that was waiting on it.
pub(crate) async fn finish(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    tile: &Tile,
    message: Option<&str>,
) -> Result<(), EngineError> {
    tx.update_tile(tile.id, &status_update(Status::Done, message))
        .await?;

    let next = tx.unblock_next_tiles(tile.id).await?;
    for next_tile in &next {
        enqueue_tile_job(tx, cache, next_tile).await?;
    }

    debug!(tile_id = tile.id, unblocked = next.len(), "Tile finished");
    Ok(())
}

/// Worker asked for a retry: requeue while the budget lasts, then park the
/// tile in RETRY for an operator.
async fn retry(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    tile: &Tile,
    message: Option<&str>,
) -> Result<(), EngineError> {
    if tile.retry_countdown > 0 {
        tx.update_tile(
            tile.id,
            &status_update(Status::Pending, message).consuming_retry(),
        )
        .await?;
        info!(
            tile_id = tile.id,
            remaining = tile.retry_countdown - 1,
            "Retrying tile automatically"
        );
        enqueue_tile_job(tx, cache, tile).await
    } else {
        warn!(tile_id = tile.id, "Tile retry budget exhausted");
        tx.update_tile(tile.id, &status_update(Status::Retry, message))
            .await
    }
}

/// Put the tile back to PENDING and re-publish its job.
async fn requeue(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    tile: &Tile,
    scene_status: Status,
    message: Option<&str>,
    force: bool,
) -> Result<(), EngineError> {
    if let Some(previous_id) = tile.previous_id {
        let previous = tx.tile(previous_id).await?;
        if previous.status != Status::Done {
            return Err(EngineError::InvalidState {
                entity: "tile",
                id: tile.id.to_string(),
                details: format!(
                    "cannot retry while previous tile {} is {}",
                    previous_id, previous.status
                ),
            });
        }
    }
    if !force && scene_status != Status::Done {
        return Err(EngineError::InvalidState {
            entity: "tile",
            id: tile.id.to_string(),
            details: format!("cannot retry while its scene is {}", scene_status),
        });
    }

    tx.update_tile(tile.id, &status_update(Status::Pending, message))
        .await?;
    info!(tile_id = tile.id, "Retrying tile");
    enqueue_tile_job(tx, cache, tile).await
}

/// Mark a tile FAILED and splice it out of the dependency graph.
///
/// The tile is reloaded from the transaction: an earlier failure in the same
/// unit of work may have re-parented it.
pub(crate) async fn fail(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    id: i64,
    message: Option<&str>,
) -> Result<(), EngineError> {
    let tile = tx.tile(id).await?;

    // 1. A failed predecessor would have been spliced out already
    if let Some(previous_id) = tile.previous_id {
        let previous = tx.tile(previous_id).await?;
        if previous.status == Status::Failed {
            return Err(EngineError::invariant(
                "fail_tile",
                format!("tile {}: previous tile {} is FAILED", id, previous_id),
            ));
        }
        // Tiles of a failing scene are spliced out one after the other
        let previous_scene = cache.get(tx, previous.scene_id).await?;
        if previous.scene_id != tile.scene_id && previous_scene.status == Status::Failed {
            return Err(EngineError::invariant(
                "fail_tile",
                format!(
                    "tile {}: scene {} of previous tile is FAILED",
                    id, previous.scene_id
                ),
            ));
        }
    }

    // 2. Persist the failure and detach from the predecessor
    tx.update_tile(id, &status_update(Status::Failed, message).clearing_previous())
        .await?;

    // 3. Dependents now follow the failed tile's predecessor
    let dependents = tx.reparent_next_tiles(id, tile.previous_id).await?;

    // 4. A failed baseline hands its role on
    if tile.reference_id.is_none()
        && let Some(new_reference) = elect_reference(tx, cache, id, &dependents).await?
    {
        tx.reassign_reference(id, new_reference).await?;
        info!(tile_id = id, new_reference, "Reference reassigned from failed tile");
    }

    // 5. Dependents of DONE scenes only waited on this tile, unless the
    // predecessor they inherit has not finished either
    let inherited_done = match tile.previous_id {
        Some(previous_id) => tx.tile(previous_id).await?.status == Status::Done,
        None => true,
    };
    let mut runnable = Vec::new();
    for dependent_id in &dependents {
        let dependent = tx.tile(*dependent_id).await?;
        if dependent.status != Status::New {
            return Err(EngineError::invariant(
                "fail_tile",
                format!(
                    "tile {}: dependent tile {} is {}",
                    id, dependent_id, dependent.status
                ),
            ));
        }
        if inherited_done && cache.get(tx, dependent.scene_id).await?.status == Status::Done {
            runnable.push(dependent);
        }
    }

    let ids: Vec<i64> = runnable.iter().map(|t| t.id).collect();
    tx.set_tiles_status(&ids, Status::Pending).await?;
    for dependent in &runnable {
        enqueue_tile_job(tx, cache, dependent).await?;
    }

    info!(
        tile_id = id,
        previous_id = ?tile.previous_id,
        reparented = dependents.len(),
        unblocked = runnable.len(),
        "Tile failed"
    );
    Ok(())
}

/// Pick the tile that replaces a failed baseline.
///
/// The lowest-id re-parented dependent wins. Tiles of a FAILED scene are
/// skipped since they fail in the same unit of work. Without an eligible
/// dependent the lowest-id live tile still referencing the baseline takes
/// over, so no reference is left pointing at a FAILED tile.
async fn elect_reference(
    tx: &mut dyn StoreTransaction,
    cache: &mut SceneCache,
    failed_id: i64,
    dependents: &[i64],
) -> Result<Option<i64>, EngineError> {
    for dependent_id in dependents {
        let dependent = tx.tile(*dependent_id).await?;
        if cache.get(tx, dependent.scene_id).await?.status != Status::Failed {
            return Ok(Some(dependent.id));
        }
    }

    for candidate in tx.referencing_tiles(failed_id).await? {
        if candidate.status != Status::Failed
            && cache.get(tx, candidate.scene_id).await?.status != Status::Failed
        {
            return Ok(Some(candidate.id));
        }
    }
    Ok(None)
}
