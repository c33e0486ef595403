//! End-to-end tests for the agent binary.
//!
//! Each test launches the compiled agent on a negotiated port through
//! `RemoteClient::launch` and drives a full session against it.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use extbridge_core::{
    BridgeError, CatalogItem, ClientOptions, DataSourceContext, DataType, LaunchSpec, ReadData,
    RemoteClient, Representation, Result,
};
use serde_json::{json, Value};
use std::time::Duration;

fn agent_spec() -> LaunchSpec {
    LaunchSpec::new(format!(
        "\"{}\" --host 127.0.0.1 --port {{remote-port}}",
        env!("CARGO_BIN_EXE_extbridge-agent")
    ))
}

async fn launch() -> RemoteClient {
    let options = ClientOptions::default().with_launch_ready_timeout(Duration::from_secs(20));
    RemoteClient::launch(&agent_spec(), options)
        .await
        .expect("agent should start")
}

fn context(source_configuration: Value) -> DataSourceContext {
    DataSourceContext {
        resource_locator: None,
        system_configuration: None,
        source_configuration,
        request_configuration: None,
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

struct RampReader {
    requests: usize,
}

#[async_trait]
impl ReadData for RampReader {
    async fn read_data(
        &mut self,
        _resource_path: &str,
        _begin: DateTime<Utc>,
        _end: DateTime<Utc>,
        buffer: &mut [f64],
    ) -> Result<()> {
        self.requests += 1;
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = if i % 2 == 1 { f64::NAN } else { i as f64 };
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_synthetic_session_against_launched_agent() {
    let client = launch().await;
    assert!(client.process_id().await.is_some());

    assert_eq!(client.initialize("synthetic").await.unwrap(), 1);

    let upgraded = client.upgrade_source_configuration(json!({})).await.unwrap();
    assert_eq!(upgraded, json!({ "amplitude": 1.0 }));

    client
        .set_context(&context(json!({ "amplitude": 3.0, "periodSecs": 60.0 })))
        .await
        .unwrap();

    let registrations = client.get_catalog_registrations("/").await.unwrap();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].path, "/SYNTHETIC");

    let range = client.get_time_range("/SYNTHETIC").await.unwrap();
    assert!(range.begin < range.end);

    let availability = client
        .get_availability("/SYNTHETIC", at(0), at(60))
        .await
        .unwrap();
    assert_eq!(availability, 1.0);

    let item = CatalogItem {
        catalog_id: "/SYNTHETIC".into(),
        resource_id: "sine".into(),
        representation: Representation::new(DataType::Float64, Duration::from_secs(1)),
    };
    let payload = client
        .read_single(at(0), at(60), "sine", &item, None)
        .await
        .unwrap();

    assert_eq!(payload.status.len(), 60);
    assert!(payload.all_present());
    let samples = payload.samples_f64().unwrap();
    assert!(samples.iter().all(|v| v.abs() <= 3.0 + 1e-9));
    // A full cycle per minute: a quarter period apart are peak and zero.
    assert!((samples[15] - samples[0]).abs() > 1.0 || (samples[45] - samples[0]).abs() > 1.0);

    client.close().await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_extension_error_does_not_end_session() {
    let client = launch().await;
    client.initialize("synthetic").await.unwrap();
    client.set_context(&context(json!({}))).await.unwrap();

    let err = client.get_time_range("/MISSING").await.unwrap_err();
    assert!(matches!(err, BridgeError::Remote { code: -32000, .. }));

    assert!(client.get_time_range("/SYNTHETIC").await.is_ok());
    client.close().await;
}

#[tokio::test]
async fn test_scaled_source_reads_through_caller() {
    let client = launch().await;
    client.initialize("scaled").await.unwrap();
    client
        .set_context(&context(json!({ "factor": 2.0 })))
        .await
        .unwrap();

    let item = CatalogItem {
        catalog_id: "/raw".into(),
        resource_id: "V1".into(),
        representation: Representation::new(DataType::Float64, Duration::from_millis(500)),
    };
    let mut reader = RampReader { requests: 0 };
    let payload = client
        .read_single(at(0), at(4), "V1", &item, Some(&mut reader))
        .await
        .unwrap();

    assert_eq!(reader.requests, 1);
    assert_eq!(payload.status, vec![1, 0, 1, 0, 1, 0, 1, 0]);
    let samples = payload.samples_f64().unwrap();
    assert_eq!(samples[0], 0.0);
    assert_eq!(samples[2], 4.0);
    assert_eq!(samples[6], 12.0);

    client.close().await;
}

#[tokio::test]
async fn test_unknown_extension_type_closes_session() {
    let client = launch().await;

    let err = client.initialize("does-not-exist").await.unwrap_err();
    assert!(matches!(err, BridgeError::Remote { code: -32001, .. }));
    assert!(client.get_time_range("/SYNTHETIC").await.is_err());

    client.close().await;
}
