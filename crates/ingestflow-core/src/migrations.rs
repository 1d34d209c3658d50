// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for ingestflow-core.
//!
//! Embeds the schema (AOIs, scenes, tiles, job outbox) so that embedders
//! can set up the database without shipping SQL files.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use ingestflow_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:ingest.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all engine migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
