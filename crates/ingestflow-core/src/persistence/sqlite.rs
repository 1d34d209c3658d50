// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed state store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::error::EngineError;
use crate::migrations;
use crate::model::{
    Aoi, NewScene, NewTile, Scene, SceneAttrs, SceneRef, StatusCounts, StatusUpdate, Tile,
    TileAttrs, TileFilter, TileLink, TileRef,
};
use crate::publisher::Topic;
use crate::status::Status;

use super::{OutboxJob, StateStore, StoreTransaction, aggregate_status};

/// SQLite-backed state store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and run migrations.
    ///
    /// In-memory databases exist per connection, so `sqlite::memory:` URLs
    /// always get a single-connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        Self::migrated(pool).await
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/ingest.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, EngineError> {
        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>, EngineError> {
        self.pool.acquire().await.map_err(EngineError::db("acquire"))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

const TILE_COLUMNS: &str =
    "id, source_id, scene_id, prev_id, ref_id, status, message, data, retry_countdown";

#[derive(sqlx::FromRow)]
struct SceneRow {
    id: i64,
    source_id: String,
    aoi_id: String,
    status: String,
    message: String,
    data: String,
    retry_countdown: i32,
}

impl TryFrom<SceneRow> for Scene {
    type Error = EngineError;

    fn try_from(row: SceneRow) -> Result<Self, Self::Error> {
        Ok(Scene {
            id: row.id,
            source_id: row.source_id,
            aoi_id: row.aoi_id,
            status: row.status.parse()?,
            message: row.message,
            attrs: serde_json::from_str(&row.data)?,
            retry_countdown: row.retry_countdown,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TileRow {
    id: i64,
    source_id: String,
    scene_id: i64,
    prev_id: Option<i64>,
    ref_id: Option<i64>,
    status: String,
    message: String,
    data: String,
    retry_countdown: i32,
}

impl TryFrom<TileRow> for Tile {
    type Error = EngineError;

    fn try_from(row: TileRow) -> Result<Self, Self::Error> {
        Ok(Tile {
            id: row.id,
            source_id: row.source_id,
            scene_id: row.scene_id,
            previous_id: row.prev_id,
            reference_id: row.ref_id,
            status: row.status.parse()?,
            message: row.message,
            attrs: serde_json::from_str(&row.data)?,
            retry_countdown: row.retry_countdown,
        })
    }
}

/// Tile joined with its scene.
#[derive(sqlx::FromRow)]
struct TileRefRow {
    id: i64,
    source_id: String,
    data: String,
    scene_id: i64,
    scene_source_id: String,
    aoi_id: String,
    scene_data: String,
}

impl TryFrom<TileRefRow> for TileRef {
    type Error = EngineError;

    fn try_from(row: TileRefRow) -> Result<Self, Self::Error> {
        Ok(TileRef {
            id: row.id,
            source_id: row.source_id,
            scene: SceneRef {
                id: row.scene_id,
                source_id: row.scene_source_id,
                aoi: row.aoi_id,
                data: serde_json::from_str(&row.scene_data)?,
            },
            data: serde_json::from_str(&row.data)?,
        })
    }
}

fn tiles_from_rows(rows: Vec<TileRow>) -> Result<Vec<Tile>, EngineError> {
    let mut tiles = rows
        .into_iter()
        .map(Tile::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    // RETURNING gives no ordering guarantee
    tiles.sort_by_key(|t| t.id);
    Ok(tiles)
}

fn counts_from_rows(rows: Vec<(String, i64)>) -> Result<StatusCounts, EngineError> {
    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        counts.set(status.parse()?, count);
    }
    Ok(counts)
}

// ============================================================================
// Queries shared by the pool and transactions
// ============================================================================

async fn fetch_aoi(conn: &mut SqliteConnection, aoi: &str) -> Result<Aoi, EngineError> {
    let row = sqlx::query_as::<_, (String, String)>("SELECT id, status FROM aoi WHERE id = ?")
        .bind(aoi)
        .fetch_optional(&mut *conn)
        .await
        .map_err(EngineError::db("get_aoi"))?;

    match row {
        Some((id, status)) => Ok(Aoi {
            id,
            status: status.parse()?,
        }),
        None => Err(EngineError::AoiNotFound {
            aoi_id: aoi.to_string(),
        }),
    }
}

async fn fetch_scene(conn: &mut SqliteConnection, id: i64) -> Result<Scene, EngineError> {
    let row = sqlx::query_as::<_, SceneRow>(
        r#"
        SELECT id, source_id, aoi_id, status, message, data, retry_countdown
        FROM scene
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(EngineError::db("get_scene"))?;

    row.ok_or_else(|| EngineError::SceneNotFound {
        scene_id: id.to_string(),
    })?
    .try_into()
}

async fn fetch_scene_id(
    conn: &mut SqliteConnection,
    aoi: &str,
    source_id: &str,
) -> Result<Option<i64>, EngineError> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM scene WHERE aoi_id = ? AND source_id = ?")
        .bind(aoi)
        .bind(source_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(EngineError::db("get_scene_id"))
}

async fn fetch_tile(conn: &mut SqliteConnection, id: i64) -> Result<Tile, EngineError> {
    let sql = format!("SELECT {} FROM tile WHERE id = ?", TILE_COLUMNS);
    let row = sqlx::query_as::<_, TileRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(EngineError::db("get_tile"))?;

    row.ok_or_else(|| EngineError::TileNotFound {
        tile_id: id.to_string(),
    })?
    .try_into()
}

async fn fetch_scene_counts(
    conn: &mut SqliteConnection,
    aoi: &str,
) -> Result<StatusCounts, EngineError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM scene WHERE aoi_id = ? GROUP BY status",
    )
    .bind(aoi)
    .fetch_all(&mut *conn)
    .await
    .map_err(EngineError::db("scene_status_counts"))?;

    counts_from_rows(rows)
}

/// Tile counts of the AOI, optionally restricted to scenes in one status.
async fn fetch_tile_counts(
    conn: &mut SqliteConnection,
    aoi: &str,
    scene_status: Option<Status>,
) -> Result<StatusCounts, EngineError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        r#"
        SELECT t.status, COUNT(*)
        FROM tile t JOIN scene s ON t.scene_id = s.id
        WHERE s.aoi_id = ?1 AND (?2 IS NULL OR s.status = ?2)
        GROUP BY t.status
        "#,
    )
    .bind(aoi)
    .bind(scene_status.map(|s| s.as_str()))
    .fetch_all(&mut *conn)
    .await
    .map_err(EngineError::db("tile_status_counts"))?;

    counts_from_rows(rows)
}

/// Resolve a tile link by source IDs within an AOI.
async fn resolve_link(
    conn: &mut SqliteConnection,
    aoi: &str,
    link: &TileLink,
    field: &str,
) -> Result<i64, EngineError> {
    let row = sqlx::query_as::<_, (i64, String)>(
        r#"
        SELECT t.id, t.status
        FROM tile t JOIN scene s ON t.scene_id = s.id
        WHERE s.aoi_id = ? AND s.source_id = ? AND t.source_id = ?
        "#,
    )
    .bind(aoi)
    .bind(&link.scene_source_id)
    .bind(&link.tile_source_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(EngineError::db("resolve_tile_link"))?;

    match row {
        None => Err(EngineError::ValidationError {
            field: field.to_string(),
            message: format!(
                "tile {}/{} not found in AOI '{}'",
                link.scene_source_id, link.tile_source_id, aoi
            ),
        }),
        Some((_, status)) if status == Status::Failed.as_str() => {
            Err(EngineError::ValidationError {
                field: field.to_string(),
                message: format!(
                    "tile {}/{} is FAILED",
                    link.scene_source_id, link.tile_source_id
                ),
            })
        }
        Some((id, _)) => Ok(id),
    }
}

// ============================================================================
// StateStore
// ============================================================================

#[async_trait]
impl StateStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, EngineError> {
        let tx = self.pool.begin().await.map_err(EngineError::db("begin"))?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn create_aoi(&self, aoi: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO aoi (id, status)
            VALUES (?, 'NEW')
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(aoi)
        .execute(&self.pool)
        .await
        .map_err(EngineError::db("create_aoi"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::AlreadyExists {
                kind: "aoi",
                id: aoi.to_string(),
            });
        }
        Ok(())
    }

    async fn aoi(&self, aoi: &str) -> Result<Aoi, EngineError> {
        fetch_aoi(&mut *self.conn().await?, aoi).await
    }

    async fn aois(&self, pattern: Option<&str>) -> Result<Vec<Aoi>, EngineError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT id, status FROM aoi WHERE (?1 IS NULL OR id GLOB ?1) ORDER BY id",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db("list_aois"))?;

        rows.into_iter()
            .map(|(id, status)| {
                Ok(Aoi {
                    id,
                    status: status.parse()?,
                })
            })
            .collect()
    }

    async fn scene(&self, id: i64) -> Result<Scene, EngineError> {
        fetch_scene(&mut *self.conn().await?, id).await
    }

    async fn scenes(&self, aoi: &str, status: Option<Status>) -> Result<Vec<Scene>, EngineError> {
        let rows = sqlx::query_as::<_, SceneRow>(
            r#"
            SELECT id, source_id, aoi_id, status, message, data, retry_countdown
            FROM scene
            WHERE aoi_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY id
            "#,
        )
        .bind(aoi)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db("list_scenes"))?;

        rows.into_iter().map(Scene::try_from).collect()
    }

    async fn scene_id(&self, aoi: &str, source_id: &str) -> Result<Option<i64>, EngineError> {
        fetch_scene_id(&mut *self.conn().await?, aoi, source_id).await
    }

    async fn scene_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError> {
        fetch_scene_counts(&mut *self.conn().await?, aoi).await
    }

    async fn tile(&self, id: i64) -> Result<Tile, EngineError> {
        fetch_tile(&mut *self.conn().await?, id).await
    }

    async fn tiles(&self, filter: &TileFilter) -> Result<Vec<Tile>, EngineError> {
        let rows = sqlx::query_as::<_, TileRow>(
            r#"
            SELECT t.id, t.source_id, t.scene_id, t.prev_id, t.ref_id,
                   t.status, t.message, t.data, t.retry_countdown
            FROM tile t JOIN scene s ON t.scene_id = s.id
            WHERE (?1 IS NULL OR s.aoi_id = ?1)
              AND (?2 IS NULL OR t.scene_id = ?2)
              AND (?3 IS NULL OR t.status = ?3)
            ORDER BY t.id
            "#,
        )
        .bind(filter.aoi.as_deref())
        .bind(filter.scene_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db("list_tiles"))?;

        tiles_from_rows(rows)
    }

    async fn tile_status_counts(&self, aoi: &str) -> Result<StatusCounts, EngineError> {
        fetch_tile_counts(&mut *self.conn().await?, aoi, None).await
    }

    async fn root_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError> {
        let rows = sqlx::query_as::<_, TileRefRow>(
            r#"
            SELECT t.id, t.source_id, t.data,
                   s.id AS scene_id, s.source_id AS scene_source_id, s.aoi_id, s.data AS scene_data
            FROM tile t JOIN scene s ON t.scene_id = s.id
            WHERE s.aoi_id = ? AND t.status != 'FAILED'
              AND t.prev_id IS NULL AND t.ref_id IS NULL
            ORDER BY t.id
            "#,
        )
        .bind(aoi)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db("root_tiles"))?;

        rows.into_iter().map(TileRef::try_from).collect()
    }

    async fn leaf_tiles(&self, aoi: &str) -> Result<Vec<TileRef>, EngineError> {
        let rows = sqlx::query_as::<_, TileRefRow>(
            r#"
            SELECT t.id, t.source_id, t.data,
                   s.id AS scene_id, s.source_id AS scene_source_id, s.aoi_id, s.data AS scene_data
            FROM tile t JOIN scene s ON t.scene_id = s.id
            WHERE s.aoi_id = ? AND t.status != 'FAILED'
              AND NOT EXISTS (SELECT 1 FROM tile next WHERE next.prev_id = t.id)
            ORDER BY t.id
            "#,
        )
        .bind(aoi)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db("leaf_tiles"))?;

        rows.into_iter().map(TileRef::try_from).collect()
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<OutboxJob>, EngineError> {
        let rows = sqlx::query_as::<_, (i64, String, Vec<u8>)>(
            "SELECT id, topic, payload FROM job_outbox ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::db("pending_jobs"))?;

        rows.into_iter()
            .map(|(id, topic, payload)| {
                Ok(OutboxJob {
                    id,
                    topic: topic.parse()?,
                    payload,
                })
            })
            .collect()
    }

    async fn ack_jobs(&self, ids: &[i64]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM job_outbox WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        query
            .build()
            .execute(&self.pool)
            .await
            .map_err(EngineError::db("ack_jobs"))?;
        Ok(())
    }
}

// ============================================================================
// StoreTransaction
// ============================================================================

/// Unit of work over one SQLite transaction.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn aoi(&mut self, aoi: &str) -> Result<Aoi, EngineError> {
        fetch_aoi(&mut self.tx, aoi).await
    }

    async fn scene(&mut self, id: i64) -> Result<Scene, EngineError> {
        fetch_scene(&mut self.tx, id).await
    }

    async fn scene_id(&mut self, aoi: &str, source_id: &str) -> Result<Option<i64>, EngineError> {
        fetch_scene_id(&mut self.tx, aoi, source_id).await
    }

    async fn create_scene(&mut self, scene: &NewScene) -> Result<i64, EngineError> {
        let data = serde_json::to_string(&scene.attrs)?;
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO scene (source_id, aoi_id, status, data, retry_countdown)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&scene.source_id)
        .bind(&scene.aoi_id)
        .bind(scene.status.as_str())
        .bind(data)
        .bind(scene.retry_countdown)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(EngineError::db("create_scene"))
    }

    async fn update_scene(&mut self, id: i64, update: &StatusUpdate) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE scene
            SET status = ?1,
                message = COALESCE(?2, message),
                retry_countdown = retry_countdown - ?3
            WHERE id = ?4
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.message.as_deref())
        .bind(if update.consume_retry { 1 } else { 0 })
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .map_err(EngineError::db("update_scene"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::SceneNotFound {
                scene_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_scene_attrs(
        &mut self,
        id: i64,
        attrs: &SceneAttrs,
    ) -> Result<(), EngineError> {
        let data = serde_json::to_string(attrs)?;
        let result = sqlx::query("UPDATE scene SET data = ? WHERE id = ?")
            .bind(data)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("update_scene_attrs"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::SceneNotFound {
                scene_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn tile(&mut self, id: i64) -> Result<Tile, EngineError> {
        fetch_tile(&mut self.tx, id).await
    }

    async fn scene_tiles(&mut self, scene_id: i64) -> Result<Vec<Tile>, EngineError> {
        let sql = format!(
            "SELECT {} FROM tile WHERE scene_id = ? ORDER BY id",
            TILE_COLUMNS
        );
        let rows = sqlx::query_as::<_, TileRow>(&sql)
            .bind(scene_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(EngineError::db("scene_tiles"))?;

        tiles_from_rows(rows)
    }

    async fn create_tile(&mut self, tile: &NewTile) -> Result<i64, EngineError> {
        let prev_id = match &tile.previous {
            Some(link) => Some(resolve_link(&mut self.tx, &tile.aoi_id, link, "previous").await?),
            None => None,
        };
        let ref_id = match &tile.reference {
            Some(link) => Some(resolve_link(&mut self.tx, &tile.aoi_id, link, "reference").await?),
            None => None,
        };
        let data = serde_json::to_string(&tile.attrs)?;

        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO tile (source_id, scene_id, prev_id, ref_id, status, data, retry_countdown)
            VALUES (?, ?, ?, ?, 'NEW', ?, ?)
            RETURNING id
            "#,
        )
        .bind(&tile.source_id)
        .bind(tile.scene_id)
        .bind(prev_id)
        .bind(ref_id)
        .bind(data)
        .bind(tile.retry_countdown)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(EngineError::db("create_tile"))
    }

    async fn update_tile(&mut self, id: i64, update: &StatusUpdate) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE tile
            SET status = ?1,
                message = COALESCE(?2, message),
                retry_countdown = retry_countdown - ?3,
                prev_id = CASE WHEN ?4 THEN NULL ELSE prev_id END
            WHERE id = ?5
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.message.as_deref())
        .bind(if update.consume_retry { 1 } else { 0 })
        .bind(update.clear_previous)
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .map_err(EngineError::db("update_tile"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TileNotFound {
                tile_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_tile_attrs(&mut self, id: i64, attrs: &TileAttrs) -> Result<(), EngineError> {
        let data = serde_json::to_string(attrs)?;
        let result = sqlx::query("UPDATE tile SET data = ? WHERE id = ?")
            .bind(data)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("update_tile_attrs"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TileNotFound {
                tile_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_tiles_status(&mut self, ids: &[i64], status: Status) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE tile SET status = ");
        query.push_bind(status.as_str());
        query.push(" WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        query
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("set_tiles_status"))?;
        Ok(())
    }

    async fn unblock_next_tiles(&mut self, previous_id: i64) -> Result<Vec<Tile>, EngineError> {
        let sql = format!(
            r#"
            UPDATE tile SET status = 'PENDING'
            WHERE prev_id = ? AND status = 'NEW'
              AND scene_id IN (SELECT id FROM scene WHERE status = 'DONE')
            RETURNING {}
            "#,
            TILE_COLUMNS
        );
        let rows = sqlx::query_as::<_, TileRow>(&sql)
            .bind(previous_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(EngineError::db("unblock_next_tiles"))?;

        tiles_from_rows(rows)
    }

    async fn unblock_scene_tiles(&mut self, scene_id: i64) -> Result<Vec<Tile>, EngineError> {
        let sql = format!(
            r#"
            UPDATE tile SET status = 'PENDING'
            WHERE scene_id = ? AND status = 'NEW'
              AND prev_id IN (SELECT id FROM tile WHERE status = 'DONE')
            RETURNING {}
            "#,
            TILE_COLUMNS
        );
        let rows = sqlx::query_as::<_, TileRow>(&sql)
            .bind(scene_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(EngineError::db("unblock_scene_tiles"))?;

        tiles_from_rows(rows)
    }

    async fn unblock_scene_root_tiles(
        &mut self,
        scene_id: i64,
    ) -> Result<Vec<Tile>, EngineError> {
        let sql = format!(
            r#"
            UPDATE tile SET status = 'PENDING'
            WHERE scene_id = ? AND status = 'NEW' AND prev_id IS NULL
            RETURNING {}
            "#,
            TILE_COLUMNS
        );
        let rows = sqlx::query_as::<_, TileRow>(&sql)
            .bind(scene_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(EngineError::db("unblock_scene_root_tiles"))?;

        tiles_from_rows(rows)
    }

    async fn reparent_next_tiles(
        &mut self,
        old_previous: i64,
        new_previous: Option<i64>,
    ) -> Result<Vec<i64>, EngineError> {
        let mut ids = sqlx::query_scalar::<_, i64>(
            "UPDATE tile SET prev_id = ? WHERE prev_id = ? RETURNING id",
        )
        .bind(new_previous)
        .bind(old_previous)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(EngineError::db("reparent_next_tiles"))?;

        ids.sort_unstable();
        Ok(ids)
    }

    async fn referencing_tiles(&mut self, reference_id: i64) -> Result<Vec<Tile>, EngineError> {
        let sql = format!("SELECT {} FROM tile WHERE ref_id = ? ORDER BY id", TILE_COLUMNS);
        let rows = sqlx::query_as::<_, TileRow>(&sql)
            .bind(reference_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(EngineError::db("referencing_tiles"))?;

        tiles_from_rows(rows)
    }

    async fn reassign_reference(
        &mut self,
        old_reference: i64,
        new_reference: i64,
    ) -> Result<(), EngineError> {
        if old_reference == new_reference {
            return Ok(());
        }

        // The new reference becomes a baseline
        sqlx::query("UPDATE tile SET ref_id = NULL WHERE id = ? AND ref_id = ?")
            .bind(new_reference)
            .bind(old_reference)
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("reassign_reference"))?;

        sqlx::query("UPDATE tile SET ref_id = ? WHERE ref_id = ?")
            .bind(new_reference)
            .bind(old_reference)
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("reassign_reference"))?;

        Ok(())
    }

    async fn refresh_aoi_status(&mut self, aoi: &str) -> Result<Status, EngineError> {
        let scene_counts = fetch_scene_counts(&mut self.tx, aoi).await?;
        let status = match aggregate_status(&scene_counts) {
            None => Status::New,
            Some(Status::Done) => {
                let tile_counts = fetch_tile_counts(&mut self.tx, aoi, Some(Status::Done)).await?;
                aggregate_status(&tile_counts).unwrap_or(Status::Done)
            }
            Some(status) => status,
        };

        sqlx::query("UPDATE aoi SET status = ?1 WHERE id = ?2 AND status != ?1")
            .bind(status.as_str())
            .bind(aoi)
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("refresh_aoi_status"))?;

        Ok(status)
    }

    async fn enqueue_job(&mut self, topic: Topic, payload: &[u8]) -> Result<(), EngineError> {
        sqlx::query("INSERT INTO job_outbox (topic, payload) VALUES (?, ?)")
            .bind(topic.as_str())
            .bind(payload)
            .execute(&mut *self.tx)
            .await
            .map_err(EngineError::db("enqueue_job"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let this = *self;
        this.tx.commit().await.map_err(EngineError::db("commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        let this = *self;
        this.tx.rollback().await.map_err(EngineError::db("rollback"))
    }
}
