// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entities, ingestion requests and job payloads.
//!
//! Job payloads (`SceneRef`, `TileJob`) and worker results (`WorkerResult`)
//! are the JSON documents exchanged with download and processing workers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::Status;

// ============================================================================
// Attribute bags
// ============================================================================

/// Position of a tile inside its scene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileMapping {
    /// Swath identifier (e.g. `IW1`).
    pub swath_id: String,
    /// Tile number within the swath.
    pub tile_nr: i32,
}

/// Free-form scene attributes, opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneAttrs {
    /// Provider UUID of the acquisition.
    pub uuid: String,
    /// Acquisition date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Tile source ID to position mapping. Must cover every ingested tile.
    #[serde(rename = "tiles")]
    pub tile_mappings: BTreeMap<String, TileMapping>,
    /// Processing graph run by the download worker.
    pub graph_name: String,
    /// Parameters of the processing graph.
    pub graph_config: BTreeMap<String, String>,
    /// External catalogue record.
    pub record_id: String,
    /// Layer name to instance ID mapping.
    pub instances_id: BTreeMap<String, String>,
}

/// Free-form tile attributes, opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileAttrs {
    /// Swath identifier.
    pub swath_id: String,
    /// Tile number within the swath.
    pub tile_nr: i32,
    /// Processing graph run by the tile worker.
    pub graph_name: String,
}

// ============================================================================
// Entities
// ============================================================================

/// Area of interest with its aggregate status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aoi {
    /// AOI name.
    pub id: String,
    /// Rolled-up status of its scenes and tiles.
    pub status: Status,
}

/// One satellite acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    /// Store identifier.
    pub id: i64,
    /// Provider identifier, unique within the AOI.
    pub source_id: String,
    /// Owning AOI.
    pub aoi_id: String,
    /// Current status.
    pub status: Status,
    /// Last status message.
    pub message: String,
    /// Attribute bag.
    pub attrs: SceneAttrs,
    /// Remaining automatic retries.
    pub retry_countdown: i32,
}

/// Processing unit of a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    /// Store identifier.
    pub id: i64,
    /// Provider identifier, unique within the scene.
    pub source_id: String,
    /// Owning scene.
    pub scene_id: i64,
    /// Tile that must be DONE before this one runs.
    pub previous_id: Option<i64>,
    /// Baseline tile, shared by many tiles.
    pub reference_id: Option<i64>,
    /// Current status.
    pub status: Status,
    /// Last status message.
    pub message: String,
    /// Attribute bag.
    pub attrs: TileAttrs,
    /// Remaining automatic retries.
    pub retry_countdown: i32,
}

impl Tile {
    /// A root has neither a previous nor a reference tile.
    pub fn is_root(&self) -> bool {
        self.previous_id.is_none() && self.reference_id.is_none()
    }
}

/// Per-status entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Entities in NEW.
    pub new: i64,
    /// Entities in PENDING.
    pub pending: i64,
    /// Entities in DONE.
    pub done: i64,
    /// Entities in RETRY.
    pub retry: i64,
    /// Entities in FAILED.
    pub failed: i64,
}

impl StatusCounts {
    /// Count for one status.
    pub fn get(&self, status: Status) -> i64 {
        match status {
            Status::New => self.new,
            Status::Pending => self.pending,
            Status::Done => self.done,
            Status::Retry => self.retry,
            Status::Failed => self.failed,
        }
    }

    /// Overwrite the count for one status.
    pub fn set(&mut self, status: Status, count: i64) {
        match status {
            Status::New => self.new = count,
            Status::Pending => self.pending = count,
            Status::Done => self.done = count,
            Status::Retry => self.retry = count,
            Status::Failed => self.failed = count,
        }
    }

    /// Sum over all statuses.
    pub fn total(&self) -> i64 {
        Status::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Filter for tile listings. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct TileFilter {
    /// Restrict to one AOI.
    pub aoi: Option<String>,
    /// Restrict to one scene.
    pub scene_id: Option<i64>,
    /// Restrict to one status.
    pub status: Option<Status>,
}

// ============================================================================
// Store inputs
// ============================================================================

/// Status write applied by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// New status.
    pub status: Status,
    /// New message; the stored message is kept when `None`.
    pub message: Option<String>,
    /// Decrement the automatic retry budget.
    pub consume_retry: bool,
    /// Clear the tile's `previous` pointer (ignored for scenes).
    pub clear_previous: bool,
}

impl StatusUpdate {
    /// Plain status write.
    pub fn to(status: Status) -> Self {
        Self {
            status,
            message: None,
            consume_retry: false,
            clear_previous: false,
        }
    }

    /// Also overwrite the status message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Also consume one automatic retry.
    pub fn consuming_retry(mut self) -> Self {
        self.consume_retry = true;
        self
    }

    /// Also detach the tile from its predecessor.
    pub fn clearing_previous(mut self) -> Self {
        self.clear_previous = true;
        self
    }
}

/// Scene row to insert.
#[derive(Debug, Clone)]
pub struct NewScene {
    /// Provider identifier.
    pub source_id: String,
    /// Owning AOI.
    pub aoi_id: String,
    /// Initial status.
    pub status: Status,
    /// Attribute bag.
    pub attrs: SceneAttrs,
    /// Automatic retry budget.
    pub retry_countdown: i32,
}

/// Tile row to insert. Links are resolved by source IDs within the AOI.
#[derive(Debug, Clone)]
pub struct NewTile {
    /// Provider identifier.
    pub source_id: String,
    /// Owning scene.
    pub scene_id: i64,
    /// AOI in which links are resolved.
    pub aoi_id: String,
    /// Temporal predecessor.
    pub previous: Option<TileLink>,
    /// Baseline tile.
    pub reference: Option<TileLink>,
    /// Attribute bag.
    pub attrs: TileAttrs,
    /// Automatic retry budget.
    pub retry_countdown: i32,
}

// ============================================================================
// Ingestion requests
// ============================================================================

/// Link to another tile by source IDs (scene + tile).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLink {
    /// Source ID of the scene owning the linked tile.
    pub scene_source_id: String,
    /// Source ID of the linked tile.
    pub tile_source_id: String,
}

/// Tile entry of an ingestion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileToIngest {
    /// Temporal predecessor.
    #[serde(default)]
    pub previous: Option<TileLink>,
    /// Baseline tile.
    #[serde(default)]
    pub reference: Option<TileLink>,
    /// Attribute bag.
    #[serde(default)]
    pub data: TileAttrs,
}

/// Scene ingestion request, as produced by the catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneToIngest {
    /// Provider identifier.
    pub source_id: String,
    /// Target AOI; must match the AOI the scene is ingested into.
    pub aoi: String,
    /// Automatic retry budget for the scene and each of its tiles.
    #[serde(default)]
    pub retry_count: i32,
    /// Attribute bag.
    #[serde(default)]
    pub data: SceneAttrs,
    /// Tiles keyed by source ID.
    pub tiles: BTreeMap<String, TileToIngest>,
}

// ============================================================================
// Job payloads and worker results
// ============================================================================

/// Scene description sent to download workers and embedded in tile jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRef {
    /// Store identifier.
    pub id: i64,
    /// Provider identifier.
    pub source_id: String,
    /// Owning AOI.
    pub aoi: String,
    /// Attribute bag.
    pub data: SceneAttrs,
}

impl From<&Scene> for SceneRef {
    fn from(scene: &Scene) -> Self {
        Self {
            id: scene.id,
            source_id: scene.source_id.clone(),
            aoi: scene.aoi_id.clone(),
            data: scene.attrs.clone(),
        }
    }
}

/// Tile description with its owning scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRef {
    /// Store identifier.
    pub id: i64,
    /// Provider identifier.
    pub source_id: String,
    /// Owning scene.
    pub scene: SceneRef,
    /// Attribute bag.
    pub data: TileAttrs,
}

impl TileRef {
    /// Pair a tile with its scene.
    pub fn new(tile: &Tile, scene: &Scene) -> Self {
        Self {
            id: tile.id,
            source_id: tile.source_id.clone(),
            scene: SceneRef::from(scene),
            data: tile.attrs.clone(),
        }
    }
}

/// Tile job sent to processing workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileJob {
    /// The tile to process.
    #[serde(flatten)]
    pub tile: TileRef,
    /// Resolved predecessor, if any.
    #[serde(
        rename = "tile_previous",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub previous: Option<TileRef>,
    /// Resolved baseline, if any.
    #[serde(
        rename = "tile_reference",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reference: Option<TileRef>,
}

/// Kind of entity a worker result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Download worker result.
    Scene,
    /// Processing worker result.
    Tile,
}

/// Result reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Scene or tile.
    #[serde(rename = "type")]
    pub kind: ResultKind,
    /// Entity identifier.
    pub id: i64,
    /// Requested status.
    pub status: Status,
    /// Worker message (error details on failure).
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_result_wire_format() {
        let result: WorkerResult =
            serde_json::from_str(r#"{"type":"tile","id":12,"status":"RETRY","message":"oom"}"#)
                .unwrap();
        assert_eq!(result.kind, ResultKind::Tile);
        assert_eq!(result.id, 12);
        assert_eq!(result.status, Status::Retry);
        assert_eq!(result.message, "oom");

        let result: WorkerResult =
            serde_json::from_str(r#"{"type":"scene","id":3,"status":"DONE"}"#).unwrap();
        assert_eq!(result.kind, ResultKind::Scene);
        assert!(result.message.is_empty());
    }

    #[test]
    fn test_tile_job_flattens_tile_and_omits_missing_links() {
        let scene = Scene {
            id: 1,
            source_id: "S1A_20240101".to_string(),
            aoi_id: "alps".to_string(),
            status: Status::Done,
            message: String::new(),
            attrs: SceneAttrs::default(),
            retry_countdown: 0,
        };
        let tile = Tile {
            id: 7,
            source_id: "IW1_3".to_string(),
            scene_id: 1,
            previous_id: None,
            reference_id: None,
            status: Status::Pending,
            message: String::new(),
            attrs: TileAttrs {
                swath_id: "IW1".to_string(),
                tile_nr: 3,
                graph_name: "coherence".to_string(),
            },
            retry_countdown: 0,
        };
        let job = TileJob {
            tile: TileRef::new(&tile, &scene),
            previous: None,
            reference: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["scene"]["aoi"], "alps");
        assert_eq!(value["data"]["tile_nr"], 3);
        assert!(value.get("tile_previous").is_none());
        assert!(value.get("tile_reference").is_none());
    }

    #[test]
    fn test_scene_attrs_tiles_key() {
        let attrs: SceneAttrs = serde_json::from_str(
            r#"{"uuid":"u-1","tiles":{"IW1_1":{"swath_id":"IW1","tile_nr":1}}}"#,
        )
        .unwrap();
        assert_eq!(attrs.tile_mappings.len(), 1);
        assert_eq!(attrs.tile_mappings["IW1_1"].tile_nr, 1);
        assert!(attrs.date.is_none());
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.set(Status::Done, 4);
        counts.set(Status::Retry, 1);
        assert_eq!(counts.get(Status::Done), 4);
        assert_eq!(counts.total(), 5);
    }
}
