// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingestflow Core - Satellite Ingestion Workflow Engine
//!
//! This crate drives satellite scenes and their tiles through a two-stage
//! processing pipeline (scene download, then per-tile processing). It keeps
//! the tile dependency graph consistent when work fails and publishes a job
//! for every scene or tile that becomes runnable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   ingest / retry / query   ┌──────────────────────┐
//! │  Catalogue, CLI, API │ ─────────────────────────▶ │                      │
//! └──────────────────────┘                            │    WorkflowEngine    │
//! ┌──────────────────────┐   WorkerResult (mpsc)      │  (single writer lock │
//! │ Download / Tile      │ ──▶ ResultConsumer ──────▶ │   + unit of work)    │
//! │ workers              │                            └──────────────────────┘
//! └──────────────────────┘                               │               │
//!            ▲                                 mutations │               │ after commit
//!            │                                           ▼               ▼
//!            │                              ┌──────────────────┐  ┌──────────────┐
//!            └───── scene-jobs / tile-jobs ─│    Publisher     │◀─│  job_outbox  │
//!                                           └──────────────────┘  │   (SQLite)   │
//!                                                                 └──────────────┘
//! ```
//!
//! # Entities
//!
//! | Entity | Unit of | Links |
//! |--------|---------|-------|
//! | AOI | grouping, rolled-up status | owns scenes |
//! | Scene | download | owns tiles |
//! | Tile | processing | `previous` (must be DONE first), `reference` (baseline) |
//!
//! # Status Lifecycle
//!
//! Worker results move entities from `PENDING` to `DONE`, `RETRY` or
//! `FAILED`. Requests that do not match the transition table in [`status`]
//! are rejected without error, which makes duplicate or stale results
//! harmless. Operators may force any transition.
//!
//! | Event | Effect |
//! |-------|--------|
//! | Scene DONE | chain heads and tiles whose previous is DONE become PENDING |
//! | Tile DONE | NEW followers in DONE scenes become PENDING |
//! | RETRY with budget left | budget consumed, entity requeued (stays PENDING) |
//! | RETRY without budget | entity parked in RETRY for an operator |
//! | Tile FAILED | tile spliced out: followers inherit its previous, a new baseline is elected |
//! | Scene FAILED | allowed only while all its tiles are NEW; every tile is failed |
//!
//! # Delivery
//!
//! Jobs are written to an outbox table inside the same transaction as the
//! state change and published only after commit. Publication is
//! at-least-once; workers are expected to be re-entrant.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ingestflow_core::{RecordingPublisher, SqliteStore, WorkflowEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(SqliteStore::connect("sqlite::memory:", 1).await?);
//! let publisher = Arc::new(RecordingPublisher::new());
//! let engine = WorkflowEngine::new(store, publisher.clone());
//!
//! engine.create_aoi("alps").await?;
//! let scene_id = engine.ingest_scene("alps", scene, &CancellationToken::new()).await?;
//! ```

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Worker result consumer loop.
pub mod consumer;

/// Error types with stable error codes.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Entities, ingestion requests and job payloads.
pub mod model;

/// Job outbox relay.
pub mod outbox;

/// Persistence layer abstraction and the SQLite backend.
pub mod persistence;

/// Job publication.
pub mod publisher;

/// Status enum and transition table.
pub mod status;

/// The workflow engine.
pub mod workflow;

pub use consumer::{ResultConsumer, ResultConsumerConfig};
pub use error::{EngineError, Result};
pub use model::{
    Aoi, ResultKind, Scene, SceneAttrs, SceneToIngest, StatusCounts, Tile, TileAttrs, TileFilter,
    TileLink, TileMapping, TileToIngest, WorkerResult,
};
pub use persistence::{SqliteStore, StateStore, StoreTransaction};
pub use publisher::{JsonLinesPublisher, Publisher, RecordingPublisher, Topic};
pub use status::{Status, Transition};
pub use workflow::{RetrySummary, WorkflowEngine};
