//! Database-backed checkpoint store

use async_trait::async_trait;
use chrono::Utc;
use flowline_common::Result;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, instrument};

use super::{CheckpointStore, CheckpointStoreType};
use crate::error::db_error;
use crate::sql::{self, Provider};

pub struct DatabaseCheckpointStore {
    pool: AnyPool,
    table: String,
}

impl DatabaseCheckpointStore {
    /// Connect and make sure the checkpoint table exists
    pub async fn connect(url: &str, table: &str) -> Result<Self> {
        let provider = Provider::from_url(url)?;
        let table = sql::validate_identifier(table)?.to_string();
        let pool = sql::connect(url, 4).await?;
        let store = Self { pool, table };
        store.ensure_table(provider).await?;
        Ok(store)
    }

    fn ddl(provider: Provider, table: &str) -> String {
        match provider {
            Provider::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 checkpoint_key VARCHAR(512) PRIMARY KEY, \
                 checkpoint_value TEXT NOT NULL, \
                 created_at TEXT NOT NULL, \
                 updated_at TEXT NOT NULL)",
                table
            ),
            Provider::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 checkpoint_key TEXT PRIMARY KEY NOT NULL, \
                 checkpoint_value TEXT NOT NULL, \
                 created_at TEXT NOT NULL, \
                 updated_at TEXT NOT NULL)",
                table
            ),
        }
    }

    async fn ensure_table(&self, provider: Provider) -> Result<()> {
        sqlx::query(&Self::ddl(provider, &self.table))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        info!(table = %self.table, ?provider, "Checkpoint table ready");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {} WHERE checkpoint_key = $1",
            self.table
        ))
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        let count: i64 = row.try_get("n").map_err(db_error)?;
        Ok(count > 0)
    }

    async fn update(&self, key: &str, value: &str, now: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET checkpoint_value = $1, updated_at = $2 WHERE checkpoint_key = $3",
            self.table
        ))
        .bind(value)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    /// Number of stored checkpoints
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.table))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        row.try_get("n").map_err(db_error)
    }
}

#[async_trait]
impl CheckpointStore for DatabaseCheckpointStore {
    fn store_type(&self) -> CheckpointStoreType {
        CheckpointStoreType::Database
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(&format!(
            "SELECT checkpoint_value FROM {} WHERE checkpoint_key = $1",
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|r| r.try_get::<String, _>("checkpoint_value"))
            .transpose()
            .map_err(db_error)
    }

    #[instrument(skip(self, value), fields(table = %self.table))]
    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        if self.exists(key).await? {
            self.update(key, value, &now).await?;
            debug!("Checkpoint updated");
            return Ok(());
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (checkpoint_key, checkpoint_value, created_at, updated_at) \
             VALUES ($1, $2, $3, $4)",
            self.table
        ))
        .bind(key)
        .bind(value)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!("Checkpoint inserted");
                Ok(())
            },
            // Lost an insert race with another writer
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                self.update(key, value, &now).await
            },
            Err(e) => Err(db_error(e)),
        }
    }
}
