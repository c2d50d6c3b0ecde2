//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;

use super::{BuildCacheRecord, CronExtraPatch, CronPage, CronQuery, Storage, StorageError};
use crate::core::definition::{CronDefinition, CronExtra, CronIdentity};
use crate::core::types::CronId;

const CRON_COLUMNS: &str = "id, created_at, updated_at, pipeline_source, pipeline_yml_name, \
     cron_expr, enable, extra, application_id, branch, base_pipeline_id, pipeline_definition_id";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn encode_extra(extra: &CronExtra) -> Result<String, StorageError> {
    serde_json::to_string(extra).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn row_to_cron(row: &SqliteRow) -> Result<CronDefinition, StorageError> {
    let extra: String = row.try_get("extra").map_err(db_err)?;
    let extra: CronExtra = serde_json::from_str(&extra)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let application_id: Option<i64> = row.try_get("application_id").map_err(db_err)?;
    let base_pipeline_id: Option<i64> = row.try_get("base_pipeline_id").map_err(db_err)?;

    Ok(CronDefinition {
        id: CronId::new(row.try_get::<i64, _>("id").map_err(db_err)? as u64),
        created_at: from_millis(row.try_get("created_at").map_err(db_err)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(db_err)?),
        pipeline_source: row.try_get("pipeline_source").map_err(db_err)?,
        pipeline_yml_name: row.try_get("pipeline_yml_name").map_err(db_err)?,
        cron_expr: row.try_get("cron_expr").map_err(db_err)?,
        enabled: row.try_get("enable").map_err(db_err)?,
        extra,
        application_id: application_id.map(|v| v as u64),
        branch: row.try_get("branch").map_err(db_err)?,
        base_pipeline_id: base_pipeline_id.map(|v| v as u64),
        pipeline_definition_id: row.try_get("pipeline_definition_id").map_err(db_err)?,
    })
}

fn row_to_build_cache(row: &SqliteRow) -> Result<BuildCacheRecord, StorageError> {
    let last_pull_at: Option<i64> = row.try_get("last_pull_at").map_err(db_err)?;
    Ok(BuildCacheRecord {
        cluster_name: row.try_get("cluster_name").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        last_pull_at: last_pull_at.map(from_millis),
        created_at: from_millis(row.try_get("created_at").map_err(db_err)?),
    })
}

fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {} IN (", column));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    separated.push_unseparated(")");
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &CronQuery) {
    push_in(qb, "pipeline_source", &query.sources);
    push_in(qb, "pipeline_yml_name", &query.yml_names);
    push_in(qb, "pipeline_definition_id", &query.pipeline_definition_ids);
    if let Some(enabled) = query.enabled {
        qb.push(" AND enable = ").push_bind(enabled);
    }
    if let Some(cluster) = &query.cluster_name {
        qb.push(" AND json_extract(extra, '$.cluster_name') = ")
            .push_bind(cluster.clone());
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_cron(&self, mut def: CronDefinition) -> Result<CronDefinition, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_crons (created_at, updated_at, pipeline_source, pipeline_yml_name,
                cron_expr, enable, extra, application_id, branch, base_pipeline_id, pipeline_definition_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_millis(def.created_at))
        .bind(to_millis(def.updated_at))
        .bind(&def.pipeline_source)
        .bind(&def.pipeline_yml_name)
        .bind(&def.cron_expr)
        .bind(def.enabled)
        .bind(encode_extra(&def.extra)?)
        .bind(def.application_id.map(|v| v as i64))
        .bind(&def.branch)
        .bind(def.base_pipeline_id.map(|v| v as i64))
        .bind(&def.pipeline_definition_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        def.id = CronId::new(result.last_insert_rowid() as u64);
        Ok(def)
    }

    async fn get_cron(&self, id: CronId) -> Result<CronDefinition, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pipeline_crons WHERE id = ?",
            CRON_COLUMNS
        ))
        .bind(id.get() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(format!("cron: {}", id)))?;

        row_to_cron(&row)
    }

    async fn update_cron(&self, def: CronDefinition) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_crons SET updated_at = ?, pipeline_source = ?, pipeline_yml_name = ?,
                cron_expr = ?, enable = ?, extra = ?, application_id = ?, branch = ?,
                base_pipeline_id = ?, pipeline_definition_id = ?
            WHERE id = ?
            "#,
        )
        .bind(to_millis(def.updated_at))
        .bind(&def.pipeline_source)
        .bind(&def.pipeline_yml_name)
        .bind(&def.cron_expr)
        .bind(def.enabled)
        .bind(encode_extra(&def.extra)?)
        .bind(def.application_id.map(|v| v as i64))
        .bind(&def.branch)
        .bind(def.base_pipeline_id.map(|v| v as i64))
        .bind(&def.pipeline_definition_id)
        .bind(def.id.get() as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("cron: {}", def.id)));
        }
        Ok(())
    }

    async fn patch_cron_extra(
        &self,
        id: CronId,
        patch: &CronExtraPatch,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let extra: String = sqlx::query_scalar("SELECT extra FROM pipeline_crons WHERE id = ?")
            .bind(id.get() as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("cron: {}", id)))?;
        let mut extra: CronExtra = serde_json::from_str(&extra)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        patch.apply(&mut extra);

        sqlx::query("UPDATE pipeline_crons SET extra = ? WHERE id = ?")
            .bind(encode_extra(&extra)?)
            .bind(id.get() as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_cron(&self, id: CronId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM pipeline_crons WHERE id = ?")
            .bind(id.get() as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("cron: {}", id)));
        }
        Ok(())
    }

    async fn find_cron(
        &self,
        identity: &CronIdentity,
    ) -> Result<Option<CronDefinition>, StorageError> {
        let rows = match identity {
            CronIdentity::Legacy {
                application_id,
                branch,
                pipeline_yml_name,
            } => {
                sqlx::query(&format!(
                    "SELECT {} FROM pipeline_crons \
                     WHERE application_id = ? AND branch = ? AND pipeline_yml_name = ? ORDER BY id",
                    CRON_COLUMNS
                ))
                .bind(*application_id as i64)
                .bind(branch)
                .bind(pipeline_yml_name)
                .fetch_all(&self.pool)
                .await
            }
            CronIdentity::Source {
                pipeline_source,
                pipeline_yml_name,
            } => {
                sqlx::query(&format!(
                    "SELECT {} FROM pipeline_crons \
                     WHERE pipeline_source = ? AND pipeline_yml_name = ? ORDER BY id",
                    CRON_COLUMNS
                ))
                .bind(pipeline_source)
                .bind(pipeline_yml_name)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        // The version tag lives in the JSON blob, so the legacy rule is
        // checked after decoding.
        for row in &rows {
            let def = row_to_cron(row)?;
            if identity.matches(&def) {
                return Ok(Some(def));
            }
        }
        Ok(None)
    }

    async fn list_enabled_crons(&self) -> Result<Vec<CronDefinition>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_crons WHERE enable = 1 AND TRIM(cron_expr) != '' ORDER BY id",
            CRON_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_cron).collect()
    }

    async fn page_crons(&self, query: &CronQuery) -> Result<CronPage, StorageError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM pipeline_crons WHERE 1 = 1");
        push_filters(&mut count, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM pipeline_crons WHERE 1 = 1",
            CRON_COLUMNS
        ));
        push_filters(&mut select, query);
        select.push(" ORDER BY id DESC");
        if !query.get_all {
            select
                .push(" LIMIT ")
                .push_bind(i64::try_from(query.page_size).unwrap_or(i64::MAX))
                .push(" OFFSET ")
                .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
        }
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(CronPage {
            total: total as u64,
            data: rows.iter().map(row_to_cron).collect::<Result<_, _>>()?,
        })
    }

    async fn save_build_cache(&self, record: BuildCacheRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO build_caches (cluster_name, name, last_pull_at, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (cluster_name, name)
            DO UPDATE SET last_pull_at = excluded.last_pull_at, created_at = excluded.created_at
            "#,
        )
        .bind(&record.cluster_name)
        .bind(&record.name)
        .bind(record.last_pull_at.map(to_millis))
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_expired_build_caches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildCacheRecord>, StorageError> {
        let cutoff = to_millis(cutoff);
        let rows = sqlx::query(
            r#"
            SELECT cluster_name, name, last_pull_at, created_at FROM build_caches
            WHERE (last_pull_at IS NULL AND created_at < ?) OR last_pull_at < ?
            ORDER BY cluster_name, name
            "#,
        )
        .bind(cutoff)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_build_cache).collect()
    }

    async fn delete_build_cache(
        &self,
        cluster_name: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM build_caches WHERE cluster_name = ? AND name = ?")
            .bind(cluster_name)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "build cache: {}/{}",
                cluster_name, name
            )));
        }
        Ok(())
    }
}
