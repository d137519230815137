//! Relational source and sink over `sqlx::Any` (PostgreSQL, SQLite)
//!
//! Connection properties: `connectionString` (or `url`), or the parts
//! `provider` (default `postgres`), `server`, `database`, `username`,
//! `password`. Extraction runs `query` verbatim, or selects from `table`
//! ordered by `incrementalColumn`, resuming after the checkpoint cursor.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use flowline_common::types::{Configuration, DataRecord, DataSourceDefinition};
use flowline_common::{FlowlineError, Result};
use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::{Any, AnyPool};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{
    max_cursor_of, require_property, Batch, ConnectorType, Extractor, FetchParams, LoadResult,
    Loader,
};
use crate::context::WorkflowContext;
use crate::error::db_error;
use crate::sql::{self, Provider};

/// Connections per cached pool
const POOL_SIZE: u32 = 5;

/// Bind parameters per INSERT statement (SQLite caps at 999)
const MAX_BIND_PARAMS: usize = 900;

/// Resolve the connection URL from a source's properties
pub fn connection_url(source: &DataSourceDefinition) -> Result<String> {
    if let Some(url) = source
        .property("connectionString")
        .or_else(|| source.property("url"))
        .filter(|u| !u.trim().is_empty())
    {
        return Ok(url.to_string());
    }

    let provider = source.property("provider").unwrap_or("postgres");
    let database = require_property(source, "database")?;
    match provider.to_lowercase().as_str() {
        "sqlite" => Ok(format!("sqlite://{}", database)),
        "postgres" | "postgresql" => {
            let server = require_property(source, "server")?;
            let credentials = match (source.property("username"), source.property("password")) {
                (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
                (Some(user), None) => format!("{}@", user),
                _ => String::new(),
            };
            Ok(format!("postgres://{}{}/{}", credentials, server, database))
        },
        other => Err(FlowlineError::configuration(format!(
            "unsupported database provider '{}'",
            other
        ))),
    }
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// Bind a cursor with the narrowest type it parses as
fn bind_cursor<'q>(query: AnyQuery<'q>, cursor: &str) -> AnyQuery<'q> {
    if let Ok(n) = cursor.parse::<i64>() {
        query.bind(n)
    } else if let Ok(f) = cursor.parse::<f64>() {
        query.bind(f)
    } else {
        query.bind(cursor.to_string())
    }
}

fn bind_json<'q>(query: AnyQuery<'q>, value: Option<&serde_json::Value>) -> AnyQuery<'q> {
    match value {
        None | Some(serde_json::Value::Null) => query.bind(Option::<String>::None),
        Some(serde_json::Value::Bool(b)) => query.bind(*b),
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Some(serde_json::Value::String(s)) => query.bind(s.clone()),
        Some(other) => query.bind(other.to_string()),
    }
}

/// Connector over relational databases; pools are cached per URL
#[derive(Default)]
pub struct DatabaseConnector {
    pools: Mutex<HashMap<String, AnyPool>>,
}

impl DatabaseConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool(&self, source: &DataSourceDefinition) -> Result<(AnyPool, Provider)> {
        let url = connection_url(source)?;
        let provider = Provider::from_url(&url)?;
        if let Some(pool) = self.pools.lock().await.get(&url) {
            return Ok((pool.clone(), provider));
        }

        // Connect without holding the map lock; a concurrent caller may
        // win the race, in which case its pool is kept
        let opened = sql::connect(&url, POOL_SIZE).await?;
        let (pool, redundant) = {
            let mut pools = self.pools.lock().await;
            match pools.get(&url) {
                Some(existing) => (existing.clone(), Some(opened)),
                None => {
                    pools.insert(url, opened.clone());
                    (opened, None)
                },
            }
        };
        match redundant {
            Some(extra) => extra.close().await,
            None => info!(source_id = %source.id, ?provider, "Opened database pool"),
        }
        Ok((pool, provider))
    }

    /// Extraction statement and whether it binds the cursor as `$1`
    fn select_statement(
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<(String, bool)> {
        let limit = params
            .max_records
            .map(|n| format!(" LIMIT {}", n))
            .unwrap_or_default();

        if let Some(query) = source.property("query").filter(|q| !q.trim().is_empty()) {
            let binds_cursor = query.contains("$1");
            return Ok((query.to_string(), binds_cursor && params.since.is_some()));
        }

        let table = sql::validate_identifier(require_property(source, "table")?)?;
        match source.property("incrementalColumn") {
            Some(column) => {
                let column = sql::validate_identifier(column)?;
                if params.since.is_some() {
                    Ok((
                        format!(
                            "SELECT * FROM {} WHERE {} > $1 ORDER BY {}{}",
                            table, column, column, limit
                        ),
                        true,
                    ))
                } else {
                    let statement = format!("SELECT * FROM {} ORDER BY {}{}", table, column, limit);
                    Ok((statement, false))
                }
            },
            None => Ok((format!("SELECT * FROM {}{}", table, limit), false)),
        }
    }

    async fn query(
        &self,
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<Vec<DataRecord>> {
        let (pool, _) = self.pool(source).await?;
        let (statement, binds_cursor) = Self::select_statement(source, params)?;
        debug!(statement = %statement, "Running extraction query");

        let mut query = sqlx::query(&statement);
        if binds_cursor {
            if let Some(since) = &params.since {
                query = bind_cursor(query, since);
            }
        }
        let rows = query.fetch_all(&pool).await.map_err(db_error)?;
        Ok(rows
            .iter()
            .map(|row| DataRecord::new(source.id.clone(), sql::row_to_json(row)))
            .collect())
    }
}

#[async_trait]
impl Extractor for DatabaseConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Database
    }

    #[instrument(skip(self, source), fields(source_id = %source.id))]
    async fn validate_connection(&self, source: &DataSourceDefinition) -> Result<bool> {
        let (pool, _) = match self.pool(source).await {
            Ok(pool) => pool,
            Err(e) if e.kind() == flowline_common::ErrorKind::Configuration => return Err(e),
            Err(e) => {
                warn!(error = %e, "Database unreachable");
                return Ok(false);
            },
        };
        Ok(sqlx::query("SELECT 1").execute(&pool).await.is_ok())
    }

    #[instrument(skip(self, source, params), fields(source_id = %source.id))]
    async fn fetch_data(
        &self,
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<Batch> {
        let query = self.query(source, params);
        let mut records = match params.timeout {
            Some(deadline) => tokio::time::timeout(deadline, query).await.map_err(|_| {
                FlowlineError::timeout(format!("query on '{}' exceeded {:?}", source.id, deadline))
            })??,
            None => query.await?,
        };
        params.limit(&mut records);

        let cursor = source
            .property("incrementalColumn")
            .and_then(|column| max_cursor_of(&records, column));
        debug!(records = records.len(), cursor = ?cursor, "Fetched database batch");
        Ok(Batch { records, cursor })
    }
}

#[async_trait]
impl Loader for DatabaseConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Database
    }

    #[instrument(
        skip(self, ctx, records, _config, target),
        fields(target_id = %target.id, records = records.len())
    )]
    async fn load(
        &self,
        ctx: &WorkflowContext,
        records: &[DataRecord],
        _config: &Configuration,
        target: &DataSourceDefinition,
    ) -> Result<LoadResult> {
        if records.is_empty() {
            return Ok(LoadResult::default());
        }
        let table = sql::validate_identifier(require_property(target, "table")?)?.to_string();
        let columns: Vec<String> = records
            .iter()
            .flat_map(|r| r.fields.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for column in &columns {
            sql::validate_identifier(column)?;
        }
        let (pool, _) = self.pool(target).await?;

        let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        let mut result = LoadResult::default();
        for chunk in records.chunks(rows_per_statement) {
            if ctx.is_cancelled() {
                return Err(FlowlineError::cancelled(format!(
                    "load to '{}' cancelled",
                    target.id
                )));
            }
            let statement = insert_statement(&table, &columns, chunk.len());
            let mut query = sqlx::query(&statement);
            for record in chunk {
                for column in &columns {
                    query = bind_json(query, record.get(column));
                }
            }
            let done = query.execute(&pool).await.map_err(db_error)?;
            result.loaded += done.rows_affected();
        }
        debug!(loaded = result.loaded, table = %table, "Database load complete");
        Ok(result)
    }
}

/// `INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)`
pub fn insert_statement(table: &str, columns: &[String], rows: usize) -> String {
    let width = columns.len();
    let values: Vec<String> = (0..rows)
        .map(|row| {
            let placeholders: Vec<String> = (1..=width)
                .map(|col| format!("${}", row * width + col))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(", "),
        values.join(", ")
    )
}
