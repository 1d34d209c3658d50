// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graphviz rendering of an AOI dependency graph.
//!
//! Scenes are boxes, tiles are plain nodes, both coloured by status. Edges
//! go from a scene to its tiles and from a previous tile to its follower;
//! edges leading to unfinished work are dotted.

use std::collections::HashMap;
use std::fmt::Write;

use crate::model::{Scene, Tile};
use crate::status::Status;

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

pub(crate) fn render(aoi: &str, scenes: &[Scene], tiles: &[Tile]) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_graph(&mut out, aoi, scenes, tiles);
    out
}

fn write_graph(
    out: &mut String,
    aoi: &str,
    scenes: &[Scene],
    tiles: &[Tile],
) -> std::fmt::Result {
    writeln!(out, "digraph \"{}\" {{", escape(aoi))?;

    for scene in scenes {
        writeln!(
            out,
            "  s{id} [label=\"{label}\\n(id={id})\" shape=box color={color}];",
            id = scene.id,
            label = escape(&scene.source_id),
            color = scene.status.color(),
        )?;
    }

    let scene_status: HashMap<i64, Status> = scenes.iter().map(|s| (s.id, s.status)).collect();
    for tile in tiles {
        writeln!(
            out,
            "  t{id} [label=\"{label}\\n(id={id})\" color={color}];",
            id = tile.id,
            label = escape(&tile.source_id),
            color = tile.status.color(),
        )?;

        let style = match scene_status.get(&tile.scene_id) {
            Some(Status::Done) => "",
            _ => " style=dotted",
        };
        writeln!(
            out,
            "  s{} -> t{} [color=gray{}];",
            tile.scene_id, tile.id, style
        )?;
    }

    for tile in tiles {
        if let Some(previous_id) = tile.previous_id {
            let style = if tile.status == Status::Done {
                ""
            } else {
                " [style=dotted]"
            };
            writeln!(out, "  t{} -> t{}{};", previous_id, tile.id, style)?;
        }
    }

    writeln!(out, "}}")
}
