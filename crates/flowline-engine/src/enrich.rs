//! Record enrichers
//!
//! - `lookup`: join against a static table from the step configuration
//! - `computed`: derived fields from `{field}` templates, plus an optional
//!   processing timestamp
//! - `rest`: per-record HTTP lookup merged under a target field

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use flowline_common::types::{
    ConfigValue, Configuration, ConfigurationExt, DataRecord, DataSourceDefinition,
};
use flowline_common::{FlowlineError, Result};
use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::connectors::rest::apply_auth;
use crate::connectors::{json_path, source_from_config, ConnectorType, Enricher, EnricherType};
use crate::context::WorkflowContext;
use crate::error::{http_error, http_status_error};
use crate::transform::{plain_string, record_field};

/// Field written by `addTimestamp` unless `timestampField` says otherwise
pub const DEFAULT_TIMESTAMP_FIELD: &str = "processed_at";

/// Field the REST enricher writes to unless `targetField` says otherwise
pub const DEFAULT_REST_TARGET_FIELD: &str = "enrichment";

/// Expand `{name}` placeholders using `resolve`.
///
/// A template that is exactly one placeholder yields the resolved value
/// with its type intact; anything else renders to a string, with
/// unresolved placeholders left empty.
pub fn render_template<F>(template: &str, resolve: F) -> serde_json::Value
where
    F: Fn(&str) -> Option<serde_json::Value>,
{
    let trimmed = template.trim();
    if let Some(name) = trimmed.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        if !name.contains(['{', '}']) {
            return resolve(name.trim()).unwrap_or(serde_json::Value::Null);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(len) => {
                let name = rest[start + 1..start + len].trim();
                if let Some(value) = resolve(name) {
                    out.push_str(&plain_string(&value));
                }
                rest = &rest[start + len + 1..];
            },
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            },
        }
    }
    out.push_str(rest);
    serde_json::Value::String(out)
}

/// Resolve a placeholder against the record, then execution parameters
fn resolver<'a>(
    record: &'a DataRecord,
    ctx: &'a WorkflowContext,
) -> impl Fn(&str) -> Option<serde_json::Value> + 'a {
    move |name| {
        record_field(record, name)
            .cloned()
            .or_else(|| ctx.parameters.get(name).map(ConfigValue::to_json))
    }
}

pub struct LookupEnricher;

#[async_trait]
impl Enricher for LookupEnricher {
    fn enricher_type(&self) -> EnricherType {
        EnricherType::Lookup
    }

    async fn enrich(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let key_field = config.require_str("lookupField")?;
        let table = config.get_map("lookupTable").ok_or_else(|| {
            FlowlineError::configuration("lookup enrichment requires 'lookupTable'")
        })?;
        let target = config.get_str("targetField");
        let prefix = config.get_str("prefix").unwrap_or("");

        let mut misses = 0usize;
        let enriched = records
            .into_iter()
            .map(|mut record| {
                let key = record_field(&record, key_field).map(plain_string);
                let Some(found) = key.and_then(|k| table.get(&k)) else {
                    misses += 1;
                    return record;
                };
                match (found, target) {
                    (_, Some(target)) => record.set(target, found.to_json()),
                    (ConfigValue::Map(fields), None) => {
                        for (name, value) in fields {
                            record.set(format!("{}{}", prefix, name), value.to_json());
                        }
                    },
                    (scalar, None) => {
                        record.set(format!("{}{}", prefix, key_field), scalar.to_json())
                    },
                }
                record
            })
            .collect();
        debug!(misses, "Lookup enrichment done");
        Ok(enriched)
    }
}

pub struct ComputedEnricher;

#[async_trait]
impl Enricher for ComputedEnricher {
    fn enricher_type(&self) -> EnricherType {
        EnricherType::Computed
    }

    async fn enrich(
        &self,
        ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let mut templates: BTreeMap<String, String> = BTreeMap::new();
        if let Some(fields) = config.get_map("computedFields") {
            for (name, template) in fields {
                let template = template.as_str().ok_or_else(|| {
                    FlowlineError::configuration(format!(
                        "computed field '{}' must be a template string",
                        name
                    ))
                })?;
                templates.insert(name.clone(), template.to_string());
            }
        }
        let timestamp_field = config.get_bool("addTimestamp").unwrap_or(false).then(|| {
            config
                .get_str("timestampField")
                .unwrap_or(DEFAULT_TIMESTAMP_FIELD)
                .to_string()
        });
        if templates.is_empty() && timestamp_field.is_none() {
            return Err(FlowlineError::configuration(
                "computed enrichment requires 'computedFields' or 'addTimestamp'",
            ));
        }

        let now = Utc::now().to_rfc3339();
        Ok(records
            .into_iter()
            .map(|mut record| {
                let computed: Vec<(String, serde_json::Value)> = templates
                    .iter()
                    .map(|(name, template)| {
                        (name.clone(), render_template(template, resolver(&record, ctx)))
                    })
                    .collect();
                for (name, value) in computed {
                    record.set(name, value);
                }
                if let Some(field) = &timestamp_field {
                    record.set(field.clone(), serde_json::Value::String(now.clone()));
                }
                record
            })
            .collect())
    }
}

/// Per-record HTTP lookup
///
/// Configuration: `url` template (`https://api/customers/{customer_id}`),
/// `targetField`, optional `dataPath`, the REST auth keys, and
/// `continueOnError` to keep records whose lookup failed.
pub struct RestEnricher {
    client: Client,
}

impl RestEnricher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Enricher for RestEnricher {
    fn enricher_type(&self) -> EnricherType {
        EnricherType::Rest
    }

    #[instrument(skip(self, ctx, records, config), fields(records = records.len()))]
    async fn enrich(
        &self,
        ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let template = config.require_str("url")?;
        let target = config
            .get_str("targetField")
            .unwrap_or(DEFAULT_REST_TARGET_FIELD)
            .to_string();
        let data_path = config.get_str("dataPath").unwrap_or("");
        let continue_on_error = config.get_bool("continueOnError").unwrap_or(false);
        let auth = source_from_config("enrich", ConnectorType::Rest, config, None);

        let mut enriched = Vec::with_capacity(records.len());
        for mut record in records {
            if ctx.is_cancelled() {
                return Err(FlowlineError::cancelled("REST enrichment cancelled"));
            }
            let url = plain_string(&render_template(template, resolver(&record, ctx)));
            match self.lookup(&url, &auth).await {
                Ok(payload) => {
                    let value = json_path(&payload, data_path)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    record.set(target.clone(), value);
                },
                Err(e) if continue_on_error => {
                    warn!(url = %url, error = %e, "Enrichment lookup failed; keeping record");
                },
                Err(e) => return Err(e),
            }
            enriched.push(record);
        }
        Ok(enriched)
    }
}

impl RestEnricher {
    async fn lookup(
        &self,
        url: &str,
        auth: &DataSourceDefinition,
    ) -> Result<serde_json::Value> {
        let request = apply_auth(self.client.get(url), auth)?;
        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_status_error(status, url));
        }
        response.json().await.map_err(http_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> DataRecord {
        DataRecord::from_json(
            "orders",
            json!({"id": 7, "first": "Ada", "last": "Lovelace", "country": "NO", "qty": 3}),
        )
    }

    #[test]
    fn test_render_template() {
        let r = record();
        let resolve = |name: &str| record_field(&r, name).cloned();
        assert_eq!(render_template("{first} {last}", resolve), json!("Ada Lovelace"));
        assert_eq!(render_template("{qty}", resolve), json!(3));
        assert_eq!(render_template("id-{id}-{missing}", resolve), json!("id-7-"));
        assert_eq!(render_template("open {brace", resolve), json!("open {brace"));
    }

    #[tokio::test]
    async fn test_lookup_merges_table_row() {
        let config: Configuration = serde_json::from_value(json!({
            "lookupField": "country",
            "lookupTable": {"NO": {"name": "Norway", "region": "EU"}},
            "prefix": "country_"
        }))
        .unwrap();
        let out = LookupEnricher
            .enrich(&WorkflowContext::standalone("wf"), vec![record()], &config)
            .await
            .unwrap();
        assert_eq!(out[0].get("country_name"), Some(&json!("Norway")));
        assert_eq!(out[0].get("country_region"), Some(&json!("EU")));
    }

    #[tokio::test]
    async fn test_lookup_miss_leaves_record() {
        let config: Configuration = serde_json::from_value(json!({
            "lookupField": "country",
            "lookupTable": {"SE": "Sweden"},
            "targetField": "country_name"
        }))
        .unwrap();
        let out = LookupEnricher
            .enrich(&WorkflowContext::standalone("wf"), vec![record()], &config)
            .await
            .unwrap();
        assert_eq!(out[0].fields, record().fields);
    }

    #[tokio::test]
    async fn test_computed_fields_and_timestamp() {
        let config: Configuration = serde_json::from_value(json!({
            "computedFields": {
                "full_name": "{first} {last}",
                "quantity": "{qty}",
                "run": "{batch}"
            },
            "addTimestamp": true
        }))
        .unwrap();
        let mut params = Configuration::new();
        params.insert("batch".into(), "nightly".into());
        let ctx = WorkflowContext::new(
            "wf",
            "ex",
            params,
            tokio_util::sync::CancellationToken::new(),
        );

        let out = ComputedEnricher.enrich(&ctx, vec![record()], &config).await.unwrap();
        assert_eq!(out[0].get("full_name"), Some(&json!("Ada Lovelace")));
        assert_eq!(out[0].get("quantity"), Some(&json!(3)));
        assert_eq!(out[0].get("run"), Some(&json!("nightly")));
        assert!(out[0].has_value(DEFAULT_TIMESTAMP_FIELD));
    }
}
