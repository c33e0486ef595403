//! Built-in extensions hosted by the agent.

mod scaled;
mod synthetic;

pub use scaled::ScaledSource;
pub use synthetic::SyntheticSource;

use chrono::{DateTime, Utc};
use extbridge_core::{BridgeError, DataType, ExtensionRegistry, Result};

/// Registry with every built-in extension type.
pub fn registry() -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();
    registry
        .register_source(SyntheticSource::TYPE_NAME, SyntheticSource::default)
        .register_source(ScaledSource::TYPE_NAME, ScaledSource::default);
    registry
}

/// Store `value` as sample `index` of a raw element buffer.
fn encode_sample(data: &mut [u8], data_type: DataType, index: usize, value: f64) -> Result<()> {
    match data_type {
        DataType::Float64 => data[index * 8..(index + 1) * 8].copy_from_slice(&value.to_le_bytes()),
        DataType::Float32 => {
            data[index * 4..(index + 1) * 4].copy_from_slice(&(value as f32).to_le_bytes())
        }
        other => {
            return Err(BridgeError::extension(format!(
                "data type {other:?} is not supported"
            )))
        }
    }
    Ok(())
}

/// Seconds since the Unix epoch, with sub-second precision.
fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) * 1e-9
}
