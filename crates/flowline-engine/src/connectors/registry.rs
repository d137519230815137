//! Capability registry, built once at startup

use std::collections::HashMap;
use std::sync::Arc;

use flowline_common::{FlowlineError, Result};
use tracing::debug;

use super::database::DatabaseConnector;
use super::filesystem::FileSystemConnector;
use super::rest::{build_client, RestConnector};
use super::streaming::{MessageBroker, StreamingConnector};
use super::{
    ConnectorType, Enricher, EnricherType, Extractor, Loader, TransformType, Transformer,
    Validator, ValidatorType,
};
use crate::config::EngineConfig;
use crate::enrich::{ComputedEnricher, LookupEnricher, RestEnricher};
use crate::transform::{AggregateTransformer, FilterTransformer, FlattenTransformer, MapTransformer};
use crate::validate::{RulesValidator, SchemaValidator};

fn missing(what: &str, tag: impl std::fmt::Display) -> FlowlineError {
    FlowlineError::configuration(format!("no {} registered for '{}'", what, tag))
}

/// Variant → implementation tables for every capability set
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    extractors: HashMap<ConnectorType, Arc<dyn Extractor>>,
    loaders: HashMap<ConnectorType, Arc<dyn Loader>>,
    transformers: HashMap<TransformType, Arc<dyn Transformer>>,
    validators: HashMap<ValidatorType, Arc<dyn Validator>>,
    enrichers: HashMap<EnricherType, Arc<dyn Enricher>>,
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in variant, sharing one HTTP client and one pool cache
    pub fn with_defaults(config: &EngineConfig, broker: Arc<dyn MessageBroker>) -> Result<Self> {
        let client = build_client(&config.http)?;
        let rest = Arc::new(RestConnector::with_client(client.clone()));
        let database = Arc::new(DatabaseConnector::new());
        let files = Arc::new(FileSystemConnector::new());
        let streaming = Arc::new(StreamingConnector::new(broker, config.streaming.clone()));

        let mut registry = Self::new();
        registry
            .register_extractor(rest.clone())
            .register_extractor(database.clone())
            .register_extractor(files.clone())
            .register_extractor(streaming.clone())
            .register_loader(rest)
            .register_loader(database)
            .register_loader(files)
            .register_loader(streaming)
            .register_transformer(Arc::new(FilterTransformer))
            .register_transformer(Arc::new(MapTransformer))
            .register_transformer(Arc::new(FlattenTransformer))
            .register_transformer(Arc::new(AggregateTransformer))
            .register_validator(Arc::new(SchemaValidator))
            .register_validator(Arc::new(RulesValidator))
            .register_enricher(Arc::new(LookupEnricher))
            .register_enricher(Arc::new(ComputedEnricher))
            .register_enricher(Arc::new(RestEnricher::new(client)));
        Ok(registry)
    }

    pub fn register_extractor(&mut self, extractor: Arc<dyn Extractor>) -> &mut Self {
        debug!(connector = %extractor.connector_type(), "Registered extractor");
        self.extractors.insert(extractor.connector_type(), extractor);
        self
    }

    pub fn register_loader(&mut self, loader: Arc<dyn Loader>) -> &mut Self {
        debug!(connector = %loader.connector_type(), "Registered loader");
        self.loaders.insert(loader.connector_type(), loader);
        self
    }

    pub fn register_transformer(&mut self, transformer: Arc<dyn Transformer>) -> &mut Self {
        self.transformers
            .insert(transformer.transform_type(), transformer);
        self
    }

    pub fn register_validator(&mut self, validator: Arc<dyn Validator>) -> &mut Self {
        self.validators.insert(validator.validator_type(), validator);
        self
    }

    pub fn register_enricher(&mut self, enricher: Arc<dyn Enricher>) -> &mut Self {
        self.enrichers.insert(enricher.enricher_type(), enricher);
        self
    }

    pub fn extractor(&self, connector: ConnectorType) -> Result<Arc<dyn Extractor>> {
        self.extractors
            .get(&connector)
            .cloned()
            .ok_or_else(|| missing("extractor", connector))
    }

    pub fn loader(&self, connector: ConnectorType) -> Result<Arc<dyn Loader>> {
        self.loaders
            .get(&connector)
            .cloned()
            .ok_or_else(|| missing("loader", connector))
    }

    pub fn transformer(&self, transform: TransformType) -> Result<Arc<dyn Transformer>> {
        self.transformers
            .get(&transform)
            .cloned()
            .ok_or_else(|| missing("transformer", transform))
    }

    pub fn validator(&self, validator: ValidatorType) -> Result<Arc<dyn Validator>> {
        self.validators
            .get(&validator)
            .cloned()
            .ok_or_else(|| missing("validator", validator))
    }

    pub fn enricher(&self, enricher: EnricherType) -> Result<Arc<dyn Enricher>> {
        self.enrichers
            .get(&enricher)
            .cloned()
            .ok_or_else(|| missing("enricher", enricher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::streaming::InMemoryBroker;
    use flowline_common::ErrorKind;

    #[test]
    fn test_defaults_cover_every_variant() {
        let broker = Arc::new(InMemoryBroker::default());
        let registry = ConnectorRegistry::with_defaults(&EngineConfig::default(), broker).unwrap();
        for connector in [
            ConnectorType::Rest,
            ConnectorType::Database,
            ConnectorType::FileSystem,
            ConnectorType::Streaming,
        ] {
            assert_eq!(registry.extractor(connector).unwrap().connector_type(), connector);
            assert_eq!(registry.loader(connector).unwrap().connector_type(), connector);
        }
        assert!(registry.transformer(TransformType::Aggregate).is_ok());
        assert!(registry.validator(ValidatorType::Rules).is_ok());
        assert!(registry.enricher(EnricherType::Lookup).is_ok());
    }

    #[test]
    fn test_missing_variant_is_configuration_error() {
        let err = ConnectorRegistry::new()
            .extractor(ConnectorType::Rest)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
