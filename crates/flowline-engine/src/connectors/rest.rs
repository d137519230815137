//! REST source and sink
//!
//! Connection properties:
//!
//! - `url` (required), `method` (default `GET`)
//! - `authType`: `none` | `bearer` (`token`) | `basic` (`username`, `password`)
//!   | `apiKey` (`apiKey`, header from `apiKeyHeader`, default `X-API-Key`)
//! - `dataPath`: dotted path to the record array inside the response
//! - `checkpointField`: record field whose maximum becomes the cursor
//! - `checkpointParam`: query parameter carrying the resume cursor (default `since`)
//! - `batchSize`: records per POST when loading (default 100)

use std::time::Duration;

use async_trait::async_trait;
use flowline_common::types::{Configuration, ConfigurationExt, DataRecord, DataSourceDefinition};
use flowline_common::{FlowlineError, Result};
use reqwest::{Client, Method, RequestBuilder};
use tracing::{debug, instrument, warn};

use super::{
    json_path, max_cursor_of, records_from_json, require_property, Batch, ConnectorType,
    Extractor, FetchParams, LoadResult, Loader,
};
use crate::config::HttpConfig;
use crate::context::WorkflowContext;
use crate::error::{http_error, http_status_error};

/// Default header for `authType = apiKey`
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Default query parameter for the resume cursor
pub const DEFAULT_CHECKPOINT_PARAM: &str = "since";

/// Default records per POST
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 100;

/// Build the shared HTTP client
pub fn build_client(config: &HttpConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(http_error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    None,
    Bearer,
    Basic,
    ApiKey,
}

impl std::str::FromStr for AuthType {
    type Err = FlowlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(AuthType::None),
            "bearer" | "token" => Ok(AuthType::Bearer),
            "basic" => Ok(AuthType::Basic),
            "apikey" | "api_key" | "api-key" => Ok(AuthType::ApiKey),
            other => Err(FlowlineError::configuration(format!(
                "unknown authType '{}'",
                other
            ))),
        }
    }
}

/// Attach credentials described by the source's connection properties
pub fn apply_auth(
    builder: RequestBuilder,
    source: &DataSourceDefinition,
) -> Result<RequestBuilder> {
    let auth: AuthType = source.property("authType").unwrap_or("none").parse()?;
    Ok(match auth {
        AuthType::None => builder,
        AuthType::Bearer => builder.bearer_auth(require_property(source, "token")?),
        AuthType::Basic => builder.basic_auth(
            require_property(source, "username")?,
            source.property("password"),
        ),
        AuthType::ApiKey => builder.header(
            source.property("apiKeyHeader").unwrap_or(DEFAULT_API_KEY_HEADER),
            require_property(source, "apiKey")?,
        ),
    })
}

fn method_of(source: &DataSourceDefinition) -> Result<Method> {
    let raw = source.property("method").unwrap_or("GET").to_uppercase();
    raw.parse::<Method>()
        .map_err(|_| FlowlineError::configuration(format!("invalid HTTP method '{}'", raw)))
}

/// HTTP-backed connector
#[derive(Debug, Clone)]
pub struct RestConnector {
    client: Client,
}

impl RestConnector {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn request(
        &self,
        source: &DataSourceDefinition,
        since: Option<&str>,
    ) -> Result<Vec<DataRecord>> {
        let url = require_property(source, "url")?;
        let mut builder = self.client.request(method_of(source)?, url);
        if let Some(since) = since {
            let param = source
                .property("checkpointParam")
                .unwrap_or(DEFAULT_CHECKPOINT_PARAM);
            builder = builder.query(&[(param, since)]);
        }
        let builder = apply_auth(builder, source)?;

        let response = builder.send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_status_error(status, url));
        }
        let payload: serde_json::Value = response.json().await.map_err(http_error)?;

        let payload = match source.property("dataPath").filter(|p| !p.is_empty()) {
            Some(path) => json_path(&payload, path).cloned().ok_or_else(|| {
                FlowlineError::execution(format!("response from {} has no '{}'", url, path))
            })?,
            None => payload,
        };
        Ok(records_from_json(&source.id, payload))
    }
}

#[async_trait]
impl Extractor for RestConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Rest
    }

    #[instrument(skip(self, source), fields(source_id = %source.id))]
    async fn validate_connection(&self, source: &DataSourceDefinition) -> Result<bool> {
        let url = require_property(source, "url")?;
        let builder = apply_auth(self.client.request(method_of(source)?, url), source)?;
        match builder.send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!(url = %url, error = %e, "REST source unreachable");
                Ok(false)
            },
        }
    }

    #[instrument(skip(self, source, params), fields(source_id = %source.id))]
    async fn fetch_data(
        &self,
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<Batch> {
        let request = self.request(source, params.since.as_deref());
        let mut records = match params.timeout {
            Some(deadline) => tokio::time::timeout(deadline, request).await.map_err(|_| {
                let message = format!("fetch from '{}' exceeded {:?}", source.id, deadline);
                FlowlineError::timeout(message)
            })??,
            None => request.await?,
        };
        params.limit(&mut records);

        let cursor = source
            .property("checkpointField")
            .and_then(|field| max_cursor_of(&records, field));
        debug!(records = records.len(), cursor = ?cursor, "Fetched REST batch");
        Ok(Batch { records, cursor })
    }
}

#[async_trait]
impl Loader for RestConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Rest
    }

    #[instrument(
        skip(self, ctx, records, config, target),
        fields(target_id = %target.id, records = records.len())
    )]
    async fn load(
        &self,
        ctx: &WorkflowContext,
        records: &[DataRecord],
        config: &Configuration,
        target: &DataSourceDefinition,
    ) -> Result<LoadResult> {
        let url = require_property(target, "url")?;
        let method = match target.property("method") {
            Some(_) => method_of(target)?,
            None => Method::POST,
        };
        let batch_size = config
            .get_u64("batchSize")
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_LOAD_BATCH_SIZE);

        let mut result = LoadResult::default();
        for chunk in records.chunks(batch_size) {
            if ctx.is_cancelled() {
                return Err(FlowlineError::cancelled(format!(
                    "load to '{}' cancelled",
                    target.id
                )));
            }
            let body: Vec<&_> = chunk.iter().map(|r| &r.fields).collect();
            let builder = self.client.request(method.clone(), url).json(&body);
            let builder = apply_auth(builder, target)?;
            let response = builder.send().await.map_err(http_error)?;
            let status = response.status();
            if status.is_success() {
                result.loaded += chunk.len() as u64;
            } else {
                let err = http_status_error(status, url);
                if err.is_retryable() && result.loaded == 0 {
                    return Err(err);
                }
                warn!(status = %status, batch = chunk.len(), "REST sink rejected batch");
                result.failed += chunk.len() as u64;
                result.errors.push(err.to_string());
            }
        }
        Ok(result)
    }
}
