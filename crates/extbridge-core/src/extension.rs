//! The data-source contract extensions implement, and how they are resolved.
//!
//! An extension type is registered under a type name through an
//! [`ExtensionFactory`]. Each session resolves one factory during
//! `initialize` and creates exactly one instance from it during `setContext`.
//!
//! Extensions implement the typed [`DataSource`] trait. The dispatcher only
//! ever sees the object-safe [`BoundDataSource`], which [`TypedFactory`]
//! produces by wrapping the typed source and decoding its configuration
//! explicitly.

use crate::error::{BridgeError, Result};
use crate::model::{
    CatalogItem, CatalogRegistration, CatalogTimeRange, DataSourceContext, LogLevel,
    ResourceCatalog,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Port through which a data source pulls raw data from the caller.
///
/// On the agent side this is implemented by a reverse `readData` call over
/// the session; on the caller side the application implements it to answer
/// those calls.
#[async_trait]
pub trait ReadData: Send {
    /// Fill `buffer` with the samples of `resource_path` in `[begin, end)`.
    async fn read_data(
        &mut self,
        resource_path: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        buffer: &mut [f64],
    ) -> Result<()>;
}

/// Output buffers of a single `readSingle` call.
pub struct ReadRequest<'a> {
    pub original_resource_name: &'a str,
    pub catalog_item: &'a CatalogItem,
    /// Raw element buffer, `element_size` bytes per sample.
    pub data: &'a mut [u8],
    /// One byte per sample, non-zero marks the sample as present.
    pub status: &'a mut [u8],
}

impl ReadRequest<'_> {
    pub fn sample_count(&self) -> usize {
        self.status.len()
    }
}

/// A typed data source.
#[async_trait]
pub trait DataSource: Send + 'static {
    /// Source configuration, decoded from the context document.
    type Config: DeserializeOwned + Send;

    /// Upgrade a stored source configuration to the current format.
    async fn upgrade_source_configuration(&mut self, configuration: Value) -> Result<Value> {
        Ok(configuration)
    }

    async fn set_context(
        &mut self,
        context: DataSourceContext<Self::Config>,
        logger: ExtensionLogger,
    ) -> Result<()>;

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>>;

    async fn enrich_catalog(&mut self, catalog: ResourceCatalog) -> Result<ResourceCatalog> {
        Ok(catalog)
    }

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<CatalogTimeRange>;

    async fn get_availability(
        &mut self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64>;

    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        request: ReadRequest<'_>,
        read_data: &mut dyn ReadData,
    ) -> Result<()>;
}

/// Object-safe view of a data source instance, as owned by a session.
#[async_trait]
pub trait BoundDataSource: Send {
    async fn upgrade_source_configuration(&mut self, configuration: Value) -> Result<Value>;

    async fn set_context(
        &mut self,
        context: DataSourceContext,
        logger: ExtensionLogger,
    ) -> Result<()>;

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>>;

    async fn enrich_catalog(&mut self, catalog: ResourceCatalog) -> Result<ResourceCatalog>;

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<CatalogTimeRange>;

    async fn get_availability(
        &mut self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64>;

    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        request: ReadRequest<'_>,
        read_data: &mut dyn ReadData,
    ) -> Result<()>;
}

struct Typed<D>(D);

#[async_trait]
impl<D: DataSource> BoundDataSource for Typed<D> {
    async fn upgrade_source_configuration(&mut self, configuration: Value) -> Result<Value> {
        self.0.upgrade_source_configuration(configuration).await
    }

    async fn set_context(
        &mut self,
        context: DataSourceContext,
        logger: ExtensionLogger,
    ) -> Result<()> {
        let configuration: D::Config =
            serde_json::from_value(context.source_configuration.clone()).map_err(|e| {
                BridgeError::InvalidParams {
                    message: format!("invalid source configuration: {e}"),
                }
            })?;
        self.0
            .set_context(context.map_configuration(configuration), logger)
            .await
    }

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>> {
        self.0.get_catalog_registrations(path).await
    }

    async fn enrich_catalog(&mut self, catalog: ResourceCatalog) -> Result<ResourceCatalog> {
        self.0.enrich_catalog(catalog).await
    }

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<CatalogTimeRange> {
        self.0.get_time_range(catalog_id).await
    }

    async fn get_availability(
        &mut self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64> {
        self.0.get_availability(catalog_id, begin, end).await
    }

    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        request: ReadRequest<'_>,
        read_data: &mut dyn ReadData,
    ) -> Result<()> {
        self.0.read(begin, end, request, read_data).await
    }
}

/// Creates instances of one extension type.
pub trait ExtensionFactory: Send + Sync {
    fn type_name(&self) -> &str;

    fn create(&self) -> Box<dyn BoundDataSource>;
}

/// Factory for a [`DataSource`] type built by a constructor closure.
pub struct TypedFactory<D> {
    type_name: String,
    constructor: Box<dyn Fn() -> D + Send + Sync>,
}

impl<D: DataSource> TypedFactory<D> {
    pub fn new(type_name: impl Into<String>, constructor: impl Fn() -> D + Send + Sync + 'static) -> Self {
        Self {
            type_name: type_name.into(),
            constructor: Box::new(constructor),
        }
    }
}

impl<D: DataSource> ExtensionFactory for TypedFactory<D> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn create(&self) -> Box<dyn BoundDataSource> {
        Box::new(Typed((self.constructor)()))
    }
}

/// Resolves an extension type name to its factory.
pub trait ExtensionResolver: Send + Sync {
    fn resolve(&self, type_name: &str) -> Result<Arc<dyn ExtensionFactory>>;
}

/// In-memory resolver backed by explicit registrations.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: HashMap<String, Arc<dyn ExtensionFactory>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its type name, replacing any previous one.
    pub fn register(&mut self, factory: impl ExtensionFactory + 'static) -> &mut Self {
        self.factories
            .insert(factory.type_name().to_string(), Arc::new(factory));
        self
    }

    /// Register a typed data source under `type_name`.
    pub fn register_source<D: DataSource>(
        &mut self,
        type_name: &str,
        constructor: impl Fn() -> D + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(TypedFactory::new(type_name, constructor))
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ExtensionResolver for ExtensionRegistry {
    fn resolve(&self, type_name: &str) -> Result<Arc<dyn ExtensionFactory>> {
        self.factories
            .get(type_name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownExtension {
                type_name: type_name.to_string(),
            })
    }
}

/// Destination of log records written by an extension.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Sink that writes records to the local `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct TracingLogSink {
    pub source: String,
}

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        level.emit(&self.source, message);
    }
}

/// Logger handed to an extension on `setContext`.
#[derive(Clone)]
pub struct ExtensionLogger {
    sink: Arc<dyn LogSink>,
}

impl ExtensionLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.sink.log(level, message.as_ref());
    }

    pub fn trace(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Information, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    pub fn critical(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Critical, message);
    }
}

impl fmt::Debug for ExtensionLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionLogger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Deserialize)]
    struct CounterConfig {
        start: u32,
    }

    #[derive(Default)]
    struct CounterSource {
        start: u32,
    }

    #[async_trait]
    impl DataSource for CounterSource {
        type Config = CounterConfig;

        async fn set_context(
            &mut self,
            context: DataSourceContext<CounterConfig>,
            logger: ExtensionLogger,
        ) -> Result<()> {
            self.start = context.source_configuration.start;
            logger.info(format!("counter starts at {}", self.start));
            Ok(())
        }

        async fn get_catalog_registrations(&mut self, _path: &str) -> Result<Vec<CatalogRegistration>> {
            Ok(vec![])
        }

        async fn get_time_range(&mut self, _catalog_id: &str) -> Result<CatalogTimeRange> {
            Err(BridgeError::extension("no time range"))
        }

        async fn get_availability(
            &mut self,
            _catalog_id: &str,
            _begin: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<f64> {
            Ok(f64::from(self.start))
        }

        async fn read(
            &mut self,
            _begin: DateTime<Utc>,
            _end: DateTime<Utc>,
            _request: ReadRequest<'_>,
            _read_data: &mut dyn ReadData,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<(LogLevel, String)>>);

    impl LogSink for CollectingSink {
        fn log(&self, level: LogLevel, message: &str) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    fn context(configuration: Value) -> DataSourceContext {
        DataSourceContext {
            resource_locator: None,
            system_configuration: None,
            source_configuration: configuration,
            request_configuration: None,
        }
    }

    #[test]
    fn test_registry_resolves_registered_types() {
        let mut registry = ExtensionRegistry::new();
        registry.register_source("counter", CounterSource::default);

        assert_eq!(registry.type_names(), vec!["counter".to_string()]);
        assert_eq!(registry.resolve("counter").unwrap().type_name(), "counter");

        let err = registry.resolve("missing").err().unwrap();
        assert!(matches!(err, BridgeError::UnknownExtension { .. }));
    }

    #[tokio::test]
    async fn test_typed_source_decodes_configuration() {
        let factory = TypedFactory::new("counter", CounterSource::default);
        let mut instance = factory.create();
        let sink = Arc::new(CollectingSink::default());

        instance
            .set_context(context(json!({ "start": 7 })), ExtensionLogger::new(sink.clone()))
            .await
            .unwrap();

        let begin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let availability = instance.get_availability("/c", begin, begin).await.unwrap();
        assert_eq!(availability, 7.0);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.as_slice(), &[(LogLevel::Information, "counter starts at 7".to_string())]);
    }

    #[tokio::test]
    async fn test_bad_configuration_is_invalid_params() {
        let mut instance = TypedFactory::new("counter", CounterSource::default).create();
        let logger = ExtensionLogger::new(Arc::new(CollectingSink::default()));

        let err = instance
            .set_context(context(json!({ "start": "seven" })), logger)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_default_methods_pass_through() {
        let mut instance = TypedFactory::new("counter", CounterSource::default).create();

        let upgraded = instance
            .upgrade_source_configuration(json!({ "start": 1 }))
            .await
            .unwrap();
        assert_eq!(upgraded, json!({ "start": 1 }));

        let catalog = instance.enrich_catalog(json!({ "id": "/c" })).await.unwrap();
        assert_eq!(catalog, json!({ "id": "/c" }));
    }
}
