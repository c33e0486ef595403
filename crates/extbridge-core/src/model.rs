//! Data model fields carried over the transport.
//!
//! Only the parts of the catalog model the wire format needs are defined
//! here: data type tags, representations, catalog items and registrations,
//! time ranges, the context document and log levels. Catalogs themselves are
//! passed through as opaque JSON.

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

/// An opaque catalog document, enriched by extensions.
pub type ResourceCatalog = Value;

/// Numeric element type of a representation.
///
/// The discriminant encodes the type class in the high byte and the bit
/// width in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl DataType {
    pub fn code(self) -> u16 {
        match self {
            DataType::Uint8 => 0x108,
            DataType::Int8 => 0x208,
            DataType::Uint16 => 0x110,
            DataType::Int16 => 0x210,
            DataType::Uint32 => 0x120,
            DataType::Int32 => 0x220,
            DataType::Uint64 => 0x140,
            DataType::Int64 => 0x240,
            DataType::Float32 => 0x320,
            DataType::Float64 => 0x340,
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        usize::from(self.code() & 0xFF) / 8
    }
}

/// How a resource is sampled: element type and sample period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Representation {
    pub data_type: DataType,
    #[serde(with = "timespan")]
    pub sample_period: Duration,
}

impl Representation {
    pub fn new(data_type: DataType, sample_period: Duration) -> Self {
        Self {
            data_type,
            sample_period,
        }
    }

    pub fn element_size(&self) -> usize {
        self.data_type.element_size()
    }

    /// Number of samples in `[begin, end)` at this representation's period.
    pub fn sample_count(&self, begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        sample_count(begin, end, self.sample_period)
    }
}

/// Number of whole sample periods in `[begin, end)`.
pub fn sample_count(begin: DateTime<Utc>, end: DateTime<Utc>, period: Duration) -> Result<usize> {
    if period.is_zero() {
        return Err(BridgeError::InvalidParams {
            message: "sample period must be greater than zero".into(),
        });
    }

    let span = (end - begin).to_std().map_err(|_| BridgeError::InvalidParams {
        message: format!("end {end} is before begin {begin}"),
    })?;

    let count = span.as_nanos() / period.as_nanos();
    usize::try_from(count).map_err(|_| BridgeError::InvalidParams {
        message: format!("range of {count} samples is too large"),
    })
}

/// A single representation of a resource within a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub catalog_id: String,
    pub resource_id: String,
    pub representation: Representation,
}

impl CatalogItem {
    /// Resource path of this item, e.g. `/sample/data/T1/1_s`.
    pub fn to_path(&self) -> String {
        format!(
            "{}/{}/{}",
            self.catalog_id,
            self.resource_id,
            format_sample_period(self.representation.sample_period)
        )
    }
}

/// A catalog an extension offers below a given path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRegistration {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_transient: bool,
}

/// Time span covered by a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTimeRange {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Context document sent with `setContext`.
///
/// The source configuration stays untyped on the wire; each extension type
/// decodes it into its own configuration type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceContext<C = Value> {
    #[serde(default)]
    pub resource_locator: Option<Url>,
    #[serde(default)]
    pub system_configuration: Option<HashMap<String, Value>>,
    pub source_configuration: C,
    #[serde(default)]
    pub request_configuration: Option<HashMap<String, Value>>,
}

impl<C> DataSourceContext<C> {
    /// Replace the source configuration, keeping everything else.
    pub fn map_configuration<T>(self, source_configuration: T) -> DataSourceContext<T> {
        DataSourceContext {
            resource_locator: self.resource_locator,
            system_configuration: self.system_configuration,
            source_configuration,
            request_configuration: self.request_configuration,
        }
    }
}

/// Severity of a log record forwarded from an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Re-emit a forwarded record through `tracing`.
    pub fn emit(self, session: &str, message: &str) {
        match self {
            LogLevel::Trace => tracing::trace!(session, "{}", message),
            LogLevel::Debug => tracing::debug!(session, "{}", message),
            LogLevel::Information => tracing::info!(session, "{}", message),
            LogLevel::Warning => tracing::warn!(session, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(session, level = ?self, "{}", message)
            }
        }
    }
}

static RESOURCE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<catalog>.*)/(?P<resource>.*)/(?P<sample_period>[0-9]+_[a-zA-Z]+)(?:_(?P<kind>[^\(#\s]+))?(?:\((?P<parameters>.*)\))?(?:#(?P<fragment>.*))?$",
    )
    .expect("resource path regex is valid")
});

/// A parsed resource path: `<catalog>/<resource>/<n>_<unit>[_kind][(params)][#fragment]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub catalog_id: String,
    pub resource_id: String,
    pub sample_period: Duration,
    pub kind: Option<String>,
    pub parameters: Option<String>,
    pub fragment: Option<String>,
}

impl ResourcePath {
    pub fn parse(path: &str) -> Result<Self> {
        let caps = RESOURCE_PATH
            .captures(path)
            .ok_or_else(|| BridgeError::InvalidParams {
                message: format!("invalid resource path '{path}'"),
            })?;

        let optional = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

        Ok(Self {
            catalog_id: caps["catalog"].to_string(),
            resource_id: caps["resource"].to_string(),
            sample_period: parse_sample_period(&caps["sample_period"])?,
            kind: optional("kind"),
            parameters: optional("parameters"),
            fragment: optional("fragment"),
        })
    }

    /// Number of samples this resource has in `[begin, end)`.
    pub fn sample_count(&self, begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        sample_count(begin, end, self.sample_period)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.catalog_id,
            self.resource_id,
            format_sample_period(self.sample_period)
        )?;
        if let Some(kind) = &self.kind {
            write!(f, "_{kind}")?;
        }
        if let Some(parameters) = &self.parameters {
            write!(f, "({parameters})")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

const UNITS: [(&str, u128); 7] = [
    ("d", 86_400_000_000_000),
    ("h", 3_600_000_000_000),
    ("min", 60_000_000_000),
    ("s", 1_000_000_000),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("ns", 1),
];

/// Parse a sample period written as `<n>_<unit>`, e.g. `10_ms` or `1_min`.
pub fn parse_sample_period(value: &str) -> Result<Duration> {
    let invalid = || BridgeError::InvalidParams {
        message: format!("invalid sample period '{value}'"),
    };

    let (count, unit) = value.split_once('_').ok_or_else(invalid)?;
    let count: u128 = count.parse().map_err(|_| invalid())?;
    let scale = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, nanos)| *nanos)
        .ok_or_else(invalid)?;

    let nanos = count.checked_mul(scale).ok_or_else(invalid)?;
    let nanos = u64::try_from(nanos).map_err(|_| invalid())?;
    if nanos == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos))
}

/// Format a sample period using the largest unit that divides it exactly.
pub fn format_sample_period(period: Duration) -> String {
    let nanos = period.as_nanos();
    for (unit, scale) in UNITS {
        if nanos != 0 && nanos % scale == 0 {
            return format!("{}_{}", nanos / scale, unit);
        }
    }
    format!("{nanos}_ns")
}

/// Serde adapter for durations written as `[d.]hh:mm:ss[.fffffff]`.
pub mod timespan {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    const TICK_NANOS: u32 = 100;

    pub fn format(value: Duration) -> String {
        let total = value.as_secs();
        let days = total / 86_400;
        let hours = (total % 86_400) / 3_600;
        let minutes = (total % 3_600) / 60;
        let seconds = total % 60;
        let ticks = value.subsec_nanos() / TICK_NANOS;

        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{days}."));
        }
        out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
        if ticks > 0 {
            out.push_str(&format!(".{ticks:07}"));
        }
        out
    }

    pub fn parse(value: &str) -> Option<Duration> {
        let mut parts = value.split(':');
        let (head, minutes, tail) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let (days, hours) = match head.split_once('.') {
            Some((days, hours)) => (days.parse::<u64>().ok()?, hours.parse::<u64>().ok()?),
            None => (0, head.parse::<u64>().ok()?),
        };
        let minutes = minutes.parse::<u64>().ok()?;

        let (seconds, nanos) = match tail.split_once('.') {
            Some((seconds, fraction)) => {
                if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let digits: String = fraction.chars().chain(std::iter::repeat('0')).take(9).collect();
                (seconds.parse::<u64>().ok()?, digits.parse::<u32>().ok()?)
            }
            None => (tail.parse::<u64>().ok()?, 0),
        };

        if hours > 23 || minutes > 59 || seconds > 59 {
            return None;
        }

        let secs = days
            .checked_mul(86_400)?
            .checked_add(hours * 3_600 + minutes * 60 + seconds)?;
        Some(Duration::new(secs, nanos))
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid time span '{raw}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DataType::Uint8.element_size(), 1);
        assert_eq!(DataType::Int16.element_size(), 2);
        assert_eq!(DataType::Float32.element_size(), 4);
        assert_eq!(DataType::Float64.element_size(), 8);
        assert_eq!(DataType::Int64.code(), 0x240);
    }

    #[test]
    fn test_catalog_item_wire_format() {
        let item = CatalogItem {
            catalog_id: "/sample/data".into(),
            resource_id: "T1".into(),
            representation: Representation::new(DataType::Float64, Duration::from_secs(1)),
        };

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({
                "catalogId": "/sample/data",
                "resourceId": "T1",
                "representation": { "dataType": "FLOAT64", "samplePeriod": "00:00:01" }
            })
        );
        assert_eq!(item.to_path(), "/sample/data/T1/1_s");
    }

    #[test]
    fn test_timespan_formats() {
        assert_eq!(timespan::format(Duration::from_secs(1)), "00:00:01");
        assert_eq!(timespan::format(Duration::from_millis(10)), "00:00:00.0100000");
        assert_eq!(timespan::format(Duration::from_secs(86_400 + 3_661)), "1.01:01:01");

        assert_eq!(timespan::parse("00:00:00.01"), Some(Duration::from_millis(10)));
        assert_eq!(timespan::parse("2.00:00:00"), Some(Duration::from_secs(172_800)));
        assert_eq!(timespan::parse("00:61:00"), None);
        assert_eq!(timespan::parse("garbage"), None);
    }

    #[test]
    fn test_timespan_rejects_overflowing_days() {
        assert_eq!(timespan::parse("300000000000000.00:00:01"), None);
        assert_eq!(timespan::parse(&format!("{}.00:00:00", u64::MAX)), None);

        let err = serde_json::from_value::<Representation>(json!({
            "dataType": "FLOAT64",
            "samplePeriod": "300000000000000.00:00:01"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid time span"));
    }

    #[test]
    fn test_sample_count() {
        let begin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();

        assert_eq!(sample_count(begin, end, Duration::from_secs(1)).unwrap(), 60);
        assert_eq!(sample_count(begin, end, Duration::from_millis(100)).unwrap(), 600);
        assert!(sample_count(end, begin, Duration::from_secs(1)).is_err());
        assert!(sample_count(begin, end, Duration::ZERO).is_err());
    }

    #[test]
    fn test_parse_resource_path() {
        let path = ResourcePath::parse("/a/b/T1/10_ms_mean(window=5)#base=1_s").unwrap();
        assert_eq!(path.catalog_id, "/a/b");
        assert_eq!(path.resource_id, "T1");
        assert_eq!(path.sample_period, Duration::from_millis(10));
        assert_eq!(path.kind.as_deref(), Some("mean"));
        assert_eq!(path.parameters.as_deref(), Some("window=5"));
        assert_eq!(path.fragment.as_deref(), Some("base=1_s"));
        assert_eq!(path.to_string(), "/a/b/T1/10_ms_mean(window=5)#base=1_s");

        let plain = ResourcePath::parse("/IN_MEMORY/TEST/T1/1_min").unwrap();
        assert_eq!(plain.sample_period, Duration::from_secs(60));
        assert!(plain.kind.is_none());

        assert!(ResourcePath::parse("no-period").is_err());
        assert!(ResourcePath::parse("/a/T1/1_fortnight").is_err());
    }

    #[test]
    fn test_format_sample_period() {
        assert_eq!(format_sample_period(Duration::from_secs(3_600)), "1_h");
        assert_eq!(format_sample_period(Duration::from_millis(1_500)), "1500_ms");
        assert_eq!(format_sample_period(Duration::from_nanos(250)), "250_ns");
    }

    #[test]
    fn test_context_document() {
        let context: DataSourceContext = serde_json::from_value(json!({
            "resourceLocator": "file:///data/",
            "sourceConfiguration": { "factor": 2.0 },
        }))
        .unwrap();

        assert_eq!(context.resource_locator.as_ref().unwrap().scheme(), "file");
        assert!(context.request_configuration.is_none());
        assert_eq!(context.source_configuration["factor"], json!(2.0));
    }

    #[test]
    fn test_log_level_names() {
        let level: LogLevel = serde_json::from_value(json!("Information")).unwrap();
        assert_eq!(level, LogLevel::Information);
        assert!(LogLevel::Critical > LogLevel::Warning);
    }
}
