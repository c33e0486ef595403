//! Rescales raw data pulled from the caller.
//!
//! Every read issues one `readData` for the requested resource and multiplies
//! the returned samples by the configured factor. NaN marks a missing sample.

use super::encode_sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extbridge_core::{
    BridgeError, CatalogRegistration, CatalogTimeRange, DataSource, DataSourceContext,
    ExtensionLogger, ReadData, ReadRequest, Result,
};
use serde::Deserialize;

const CATALOG_ID: &str = "/SCALED";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledConfig {
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    /// Time range reported for the catalog.
    pub time_range: Option<CatalogTimeRange>,
}

#[derive(Debug, Default)]
pub struct ScaledSource {
    config: Option<ScaledConfig>,
    logger: Option<ExtensionLogger>,
}

impl ScaledSource {
    pub const TYPE_NAME: &'static str = "scaled";

    fn config(&self) -> Result<&ScaledConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| BridgeError::extension("scaled source has no configuration"))
    }
}

#[async_trait]
impl DataSource for ScaledSource {
    type Config = ScaledConfig;

    async fn set_context(
        &mut self,
        context: DataSourceContext<ScaledConfig>,
        logger: ExtensionLogger,
    ) -> Result<()> {
        let config = context.source_configuration;
        if !config.factor.is_finite() {
            return Err(BridgeError::InvalidParams {
                message: format!("factor must be finite, got {}", config.factor),
            });
        }

        logger.debug(format!(
            "Scaling by {} with offset {}",
            config.factor, config.offset
        ));
        self.config = Some(config);
        self.logger = Some(logger);
        Ok(())
    }

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>> {
        if path != "/" {
            return Ok(Vec::new());
        }
        Ok(vec![CatalogRegistration {
            path: CATALOG_ID.to_string(),
            title: Some("Scaled raw data".to_string()),
            is_transient: true,
        }])
    }

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<CatalogTimeRange> {
        self.config()?
            .time_range
            .ok_or_else(|| BridgeError::extension(format!("no time range for '{catalog_id}'")))
    }

    async fn get_availability(
        &mut self,
        _catalog_id: &str,
        _begin: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<f64> {
        Ok(1.0)
    }

    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        mut request: ReadRequest<'_>,
        read_data: &mut dyn ReadData,
    ) -> Result<()> {
        let (factor, offset) = {
            let config = self.config()?;
            (config.factor, config.offset)
        };
        let data_type = request.catalog_item.representation.data_type;
        let path = request.catalog_item.to_path();

        let mut raw = vec![0.0; request.sample_count()];
        read_data.read_data(&path, begin, end, &mut raw).await?;

        let mut missing = 0;
        for (index, value) in raw.into_iter().enumerate() {
            if value.is_nan() {
                request.status[index] = 0;
                missing += 1;
                continue;
            }
            encode_sample(request.data, data_type, index, value * factor + offset)?;
            request.status[index] = 1;
        }

        if missing > 0 {
            if let Some(logger) = &self.logger {
                logger.warn(format!("{path}: {missing} sample(s) missing"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extbridge_core::{CatalogItem, DataType, LogSink, Representation};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FixedReader(Vec<f64>);

    #[async_trait]
    impl ReadData for FixedReader {
        async fn read_data(
            &mut self,
            _resource_path: &str,
            _begin: DateTime<Utc>,
            _end: DateTime<Utc>,
            buffer: &mut [f64],
        ) -> Result<()> {
            buffer.copy_from_slice(&self.0);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl LogSink for Collect {
        fn log(&self, _level: extbridge_core::LogLevel, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn test_scales_and_marks_nan_missing() {
        let sink = Arc::new(Collect::default());
        let mut source = ScaledSource::default();
        let context = DataSourceContext {
            resource_locator: None,
            system_configuration: None,
            source_configuration: serde_json::from_value::<ScaledConfig>(json!({ "factor": 10.0, "offset": 1.0 }))
                .unwrap(),
            request_configuration: None,
        };
        source
            .set_context(context, ExtensionLogger::new(sink.clone()))
            .await
            .unwrap();

        let item = CatalogItem {
            catalog_id: "/raw".into(),
            resource_id: "V".into(),
            representation: Representation::new(DataType::Float64, Duration::from_secs(1)),
        };
        let mut data = vec![0u8; 24];
        let mut status = vec![0u8; 3];
        let begin = Utc::now();
        let mut reader = FixedReader(vec![1.0, f64::NAN, -2.0]);

        source
            .read(
                begin,
                begin + chrono::Duration::seconds(3),
                ReadRequest {
                    original_resource_name: "V",
                    catalog_item: &item,
                    data: &mut data,
                    status: &mut status,
                },
                &mut reader,
            )
            .await
            .unwrap();

        assert_eq!(status, vec![1, 0, 1]);
        assert_eq!(&data[0..8], &11.0f64.to_le_bytes());
        assert_eq!(&data[16..24], &(-19.0f64).to_le_bytes());

        let messages = sink.0.lock().unwrap();
        assert!(messages.iter().any(|m| m == "/raw/V/1_s: 1 sample(s) missing"));
    }

    #[tokio::test]
    async fn test_time_range_requires_configuration() {
        let mut source = ScaledSource::default();
        assert!(source.get_time_range(CATALOG_ID).await.is_err());
    }
}
