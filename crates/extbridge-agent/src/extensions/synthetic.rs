//! Deterministic sine series, useful for wiring checks and demos.

use super::{encode_sample, epoch_seconds};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use extbridge_core::{
    BridgeError, CatalogRegistration, CatalogTimeRange, DataSource, DataSourceContext,
    ExtensionLogger, ReadData, ReadRequest, Result,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::f64::consts::TAU;

const CATALOG_ID: &str = "/SYNTHETIC";
const DEFAULT_AMPLITUDE: f64 = 1.0;
const DEFAULT_PERIOD_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticConfig {
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Length of one sine cycle in seconds.
    #[serde(default = "default_period")]
    pub period_secs: f64,
}

fn default_amplitude() -> f64 {
    DEFAULT_AMPLITUDE
}

fn default_period() -> f64 {
    DEFAULT_PERIOD_SECS
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            amplitude: DEFAULT_AMPLITUDE,
            period_secs: DEFAULT_PERIOD_SECS,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyntheticSource {
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub const TYPE_NAME: &'static str = "synthetic";

    /// Value of the series at `time`.
    pub fn value_at(&self, time: DateTime<Utc>) -> f64 {
        let phase = epoch_seconds(time) / self.config.period_secs;
        self.config.amplitude * (TAU * phase).sin()
    }

    fn check_catalog(catalog_id: &str) -> Result<()> {
        if catalog_id == CATALOG_ID {
            Ok(())
        } else {
            Err(BridgeError::extension(format!("unknown catalog '{catalog_id}'")))
        }
    }
}

#[async_trait]
impl DataSource for SyntheticSource {
    type Config = SyntheticConfig;

    async fn upgrade_source_configuration(&mut self, mut configuration: Value) -> Result<Value> {
        if configuration.is_null() {
            configuration = json!({});
        }
        let map = configuration
            .as_object_mut()
            .ok_or_else(|| BridgeError::extension("source configuration must be an object"))?;
        map.entry("amplitude").or_insert(json!(DEFAULT_AMPLITUDE));
        Ok(configuration)
    }

    async fn set_context(
        &mut self,
        context: DataSourceContext<SyntheticConfig>,
        logger: ExtensionLogger,
    ) -> Result<()> {
        let config = context.source_configuration;
        if !config.period_secs.is_finite() || config.period_secs <= 0.0 {
            return Err(BridgeError::InvalidParams {
                message: format!("period must be positive, got {}", config.period_secs),
            });
        }

        logger.info(format!(
            "Synthetic source ready (amplitude {}, period {} s)",
            config.amplitude, config.period_secs
        ));
        self.config = config;
        Ok(())
    }

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>> {
        if path != "/" {
            return Ok(Vec::new());
        }
        Ok(vec![CatalogRegistration {
            path: CATALOG_ID.to_string(),
            title: Some("Synthetic sine series".to_string()),
            is_transient: false,
        }])
    }

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<CatalogTimeRange> {
        Self::check_catalog(catalog_id)?;
        let (Some(begin), Some(end)) = (
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single(),
            Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).single(),
        ) else {
            return Err(BridgeError::extension("time range out of bounds"));
        };
        Ok(CatalogTimeRange { begin, end })
    }

    async fn get_availability(
        &mut self,
        catalog_id: &str,
        _begin: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<f64> {
        Self::check_catalog(catalog_id)?;
        Ok(1.0)
    }

    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        _end: DateTime<Utc>,
        mut request: ReadRequest<'_>,
        _read_data: &mut dyn ReadData,
    ) -> Result<()> {
        let representation = &request.catalog_item.representation;
        let period = chrono::Duration::from_std(representation.sample_period)
            .map_err(|e| BridgeError::extension(format!("sample period out of range: {e}")))?;

        let mut time = begin;
        for index in 0..request.sample_count() {
            encode_sample(request.data, representation.data_type, index, self.value_at(time))?;
            request.status[index] = 1;
            time += period;
        }
        Ok(())
    }
}
