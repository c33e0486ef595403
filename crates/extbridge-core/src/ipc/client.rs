//! Caller half of a session.
//!
//! `RemoteClient` opens the two tagged connections to an agent (or launches
//! the agent first), issues forward calls one at a time and, while awaiting
//! each response, serves whatever the agent sends back: `log` notifications
//! and nested `readData` requests.
//!
//! # Thread Safety
//!
//! Both streams sit behind one tokio `Mutex`, so concurrent callers are
//! serialized and the control channel never carries two exchanges at once.

use super::data::{buffer_length, pack_f64, BulkPayload};
use super::protocol::{read_frame, write_frame, write_message, RpcMessage, RpcRequest, RpcResponse};
use crate::config::{ClientOptions, TransportConfig};
use crate::error::{BridgeError, Result};
use crate::extension::ReadData;
use crate::model::{
    CatalogItem, CatalogRegistration, CatalogTimeRange, DataSourceContext, LogLevel,
    ResourceCatalog, ResourcePath,
};
use crate::process::{ports, LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::session::{ChannelKind, Handshake};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ClientIo {
    comm: TcpStream,
    data: TcpStream,
}

/// Client for one session with a remote agent.
pub struct RemoteClient {
    session_id: Uuid,
    addr: SocketAddr,
    options: ClientOptions,
    io: Mutex<ClientIo>,
    next_id: AtomicU64,
    closed: AtomicBool,
    process: Mutex<Option<ProcessHandle>>,
}

impl RemoteClient {
    /// Connect to an agent listening on `addr` with a fresh session id.
    pub async fn connect(addr: SocketAddr, options: ClientOptions) -> Result<Self> {
        let session_id = Uuid::new_v4();
        let comm = open_channel(addr, session_id, ChannelKind::Comm, &options).await?;
        let data = open_channel(addr, session_id, ChannelKind::Data, &options).await?;

        debug!("Session {} connected to {}", session_id, addr);

        Ok(Self {
            session_id,
            addr,
            options,
            io: Mutex::new(ClientIo { comm, data }),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            process: Mutex::new(None),
        })
    }

    /// Launch an agent on a negotiated port and connect to it.
    ///
    /// The port is injected into `spec` under the `remote-port` placeholder.
    /// If the agent does not accept connections in time the child is killed
    /// and the launch is retried on a freshly allocated port.
    pub async fn launch(spec: &LaunchSpec, options: ClientOptions) -> Result<Self> {
        let mut last_error = None;

        for attempt in 1..=options.launch_attempts {
            let port = ports::global().allocate(options.port_range)?;
            let spec = spec
                .clone()
                .with_param(TransportConfig::PORT_PLACEHOLDER, port.to_string());
            let mut process = ProcessLauncher::launch(&spec)?;
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

            match Self::wait_until_ready(addr, &options, &mut process).await {
                Ok(client) => {
                    info!(
                        "Agent {} (pid {}) ready on port {}",
                        process.command(),
                        process.id(),
                        port
                    );
                    *client.process.lock().await = Some(process);
                    return Ok(client);
                }
                Err(e) => {
                    warn!("Launch attempt {} on port {} failed: {}", attempt, port, e);
                    let _ = process.kill().await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BridgeError::Launch {
            command: spec.command_template.clone(),
            message: "no launch attempts were made".into(),
        }))
    }

    async fn wait_until_ready(
        addr: SocketAddr,
        options: &ClientOptions,
        process: &mut ProcessHandle,
    ) -> Result<Self> {
        let deadline = Instant::now() + options.launch_ready_timeout;

        loop {
            if process.has_exited() {
                return Err(BridgeError::Launch {
                    command: process.command().to_string(),
                    message: "process exited before accepting connections".into(),
                });
            }

            match Self::connect(addr, options.clone()).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    tokio::time::sleep(TransportConfig::LAUNCH_RETRY_DELAY).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(BridgeError::Timeout(options.launch_ready_timeout));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// PID of the launched agent, if this client started one.
    pub async fn process_id(&self) -> Option<u32> {
        self.process.lock().await.as_ref().map(ProcessHandle::id)
    }

    /// Select the extension type. Returns the agent's API level.
    pub async fn initialize(&self, type_name: &str) -> Result<i32> {
        let level = self.call("initialize", vec![json!(type_name)]).await?;
        let level = serde_json::from_value::<i32>(level)?;

        if level != TransportConfig::API_LEVEL {
            self.close().await;
            return Err(BridgeError::protocol(format!(
                "agent API level {level} is not supported (expected {})",
                TransportConfig::API_LEVEL
            )));
        }
        Ok(level)
    }

    pub async fn upgrade_source_configuration(&self, configuration: Value) -> Result<Value> {
        self.call("upgradeSourceConfiguration", vec![configuration])
            .await
    }

    pub async fn set_context(&self, context: &DataSourceContext) -> Result<()> {
        self.call("setContext", vec![serde_json::to_value(context)?])
            .await?;
        Ok(())
    }

    pub async fn get_catalog_registrations(&self, path: &str) -> Result<Vec<CatalogRegistration>> {
        let value = self
            .call("getCatalogRegistrations", vec![json!(path)])
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn enrich_catalog(&self, catalog: ResourceCatalog) -> Result<ResourceCatalog> {
        self.call("enrichCatalog", vec![catalog]).await
    }

    pub async fn get_time_range(&self, catalog_id: &str) -> Result<CatalogTimeRange> {
        let value = self
            .call("getTimeRange", vec![json!(catalog_id)])
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_availability(
        &self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64> {
        let value = self
            .call(
                "getAvailability",
                vec![json!(catalog_id), json!(begin), json!(end)],
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Read one representation. `read_data` answers the agent's nested
    /// `readData` requests; without it they are answered with an error.
    pub async fn read_single(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        original_resource_name: &str,
        catalog_item: &CatalogItem,
        read_data: Option<&mut dyn ReadData>,
    ) -> Result<BulkPayload> {
        let representation = &catalog_item.representation;
        let samples = representation.sample_count(begin, end)?;
        buffer_length(samples, representation.element_size())?;
        let params = vec![
            json!(begin),
            json!(end),
            json!(original_resource_name),
            serde_json::to_value(catalog_item)?,
        ];

        let (_, payload) = self
            .exchange("readSingle", params, read_data, Some(representation.element_size()))
            .await?;
        let payload = payload.ok_or_else(|| BridgeError::protocol("readSingle returned no payload"))?;

        if payload.status.len() != samples {
            self.close().await;
            return Err(BridgeError::protocol(format!(
                "expected {samples} samples, received {}",
                payload.status.len()
            )));
        }
        Ok(payload)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (value, _) = self.exchange(method, params, None, None).await?;
        Ok(value)
    }

    async fn exchange(
        &self,
        method: &str,
        params: Vec<Value>,
        read_data: Option<&mut dyn ReadData>,
        bulk_element_size: Option<usize>,
    ) -> Result<(Value, Option<BulkPayload>)> {
        let mut io = self.io.lock().await;
        if self.is_closed() {
            return Err(BridgeError::transport_closed("client is closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);

        let outcome = tokio::time::timeout(
            self.options.call_timeout,
            run_exchange(&mut io, self.session_id, request, read_data, bulk_element_size),
        )
        .await
        .unwrap_or_else(|_| Err(BridgeError::Timeout(self.options.call_timeout)));

        if let Err(e) = &outcome {
            if e.is_session_fatal() {
                warn!("Session {}: {} failed, closing: {}", self.session_id, method, e);
                self.teardown(&mut io).await;
            }
        }
        outcome
    }

    /// Shut down both connections and kill a launched agent.
    pub async fn close(&self) {
        let mut io = self.io.lock().await;
        self.teardown(&mut io).await;
    }

    async fn teardown(&self, io: &mut ClientIo) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = io.comm.shutdown().await;
        let _ = io.data.shutdown().await;

        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.kill().await {
                warn!("Failed to kill agent process {}: {}", process.id(), e);
            }
        }
        debug!("Session {} closed", self.session_id);
    }
}

async fn open_channel(
    addr: SocketAddr,
    session_id: Uuid,
    kind: ChannelKind,
    options: &ClientOptions,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BridgeError::Timeout(options.connect_timeout))??;
    let _ = stream.set_nodelay(true);

    Handshake::new(session_id, kind).write_to(&mut stream).await?;
    Ok(stream)
}

async fn run_exchange(
    io: &mut ClientIo,
    session_id: Uuid,
    request: RpcRequest,
    mut read_data: Option<&mut dyn ReadData>,
    bulk_element_size: Option<usize>,
) -> Result<(Value, Option<BulkPayload>)> {
    write_message(&mut io.comm, &request).await?;

    let result = loop {
        let frame = read_frame(&mut io.comm).await?;

        match RpcMessage::parse(&frame)? {
            RpcMessage::Response(response) if response.id == request.id => {
                break response.into_result(&request.method)?;
            }
            RpcMessage::Response(response) => {
                return Err(BridgeError::protocol(format!(
                    "response id {:?} does not match request {:?}",
                    response.id, request.id
                )));
            }
            RpcMessage::Request(incoming) if incoming.method == "log" && incoming.id.is_none() => {
                forward_log(session_id, &incoming);
            }
            RpcMessage::Request(incoming) if incoming.method == "readData" => {
                serve_read_data(io, &incoming, read_data.as_deref_mut()).await?;
            }
            RpcMessage::Request(incoming) => {
                return Err(BridgeError::protocol(format!(
                    "unexpected request '{}' from agent",
                    incoming.method
                )));
            }
        }
    };

    let payload = match bulk_element_size {
        Some(element_size) => Some(BulkPayload::read_from(&mut io.data, element_size).await?),
        None => None,
    };
    Ok((result, payload))
}

fn forward_log(session_id: Uuid, notification: &RpcRequest) {
    let level = notification.param::<LogLevel>(0, "level");
    let message = notification.param::<String>(1, "message");
    match (level, message) {
        (Ok(level), Ok(message)) => level.emit(&session_id.to_string(), &message),
        (Err(e), _) | (_, Err(e)) => warn!("Session {}: malformed log notification: {}", session_id, e),
    }
}

/// Answer a nested `readData` request: the response goes out first, then
/// exactly one data frame if the read succeeded.
async fn serve_read_data(
    io: &mut ClientIo,
    request: &RpcRequest,
    read_data: Option<&mut (dyn ReadData + '_)>,
) -> Result<()> {
    let id = request
        .id
        .clone()
        .ok_or_else(|| BridgeError::protocol("readData without an id"))?;

    let outcome = read_samples(request, read_data).await;

    match outcome {
        Ok(samples) => {
            write_message(&mut io.comm, &RpcResponse::success(Some(id), Value::Null)).await?;
            write_frame(&mut io.data, &pack_f64(&samples)).await
        }
        Err(e) if e.is_session_fatal() => Err(e),
        Err(e) => {
            debug!("readData failed: {}", e);
            write_message(&mut io.comm, &RpcResponse::from_error(Some(id), &e)).await
        }
    }
}

async fn read_samples(
    request: &RpcRequest,
    read_data: Option<&mut (dyn ReadData + '_)>,
) -> Result<Vec<f64>> {
    let resource_path: String = request.param(0, "resourcePath")?;
    let begin: DateTime<Utc> = request.param(1, "begin")?;
    let end: DateTime<Utc> = request.param(2, "end")?;

    let reader = read_data.ok_or_else(|| BridgeError::extension("no data source available for readData"))?;
    let samples = ResourcePath::parse(&resource_path)?.sample_count(begin, end)?;
    buffer_length(samples, std::mem::size_of::<f64>())?;

    let mut buffer = vec![0.0; samples];
    reader
        .read_data(&resource_path, begin, end, &mut buffer)
        .await
        .map_err(|e| {
            if e.is_session_fatal() {
                BridgeError::extension(e.to_string())
            } else {
                e
            }
        })?;
    Ok(buffer)
}
