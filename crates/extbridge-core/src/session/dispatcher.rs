//! Per-session RPC dispatch.
//!
//! A dispatcher owns both channels of one paired session and serves its
//! requests strictly one at a time:
//!
//! ```text
//! Unbound --initialize--> Bound --setContext--> Active --(fatal error)--> Closed
//! ```
//!
//! Frames leave the control channel through a single writer task, so log
//! notifications raised by the extension at any point are serialized with
//! responses and reverse requests. Reverse `readData` calls are issued and
//! awaited inline, inside the handling of the `readSingle` that caused them.

use super::Session;
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use crate::extension::{
    BoundDataSource, ExtensionFactory, ExtensionLogger, ExtensionResolver, LogSink, ReadData,
    ReadRequest,
};
use crate::ipc::data::{buffer_length, read_buffer_exact, unpack_f64, BulkPayload};
use crate::ipc::protocol::{read_frame, write_frame, RpcMessage, RpcRequest, RpcResponse};
use crate::model::{CatalogItem, DataSourceContext, LogLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum DispatchState {
    Unbound,
    Bound {
        factory: Arc<dyn ExtensionFactory>,
    },
    Active {
        factory: Arc<dyn ExtensionFactory>,
        instance: Box<dyn BoundDataSource>,
    },
    Closed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Unbound => "Unbound",
            DispatchState::Bound { .. } => "Bound",
            DispatchState::Active { .. } => "Active",
            DispatchState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

enum Reply {
    Value(Value),
    /// `null` response followed by a bulk payload on the data channel.
    Bulk(BulkPayload),
}

/// Queue of outgoing control frames, drained by the session's writer task.
#[derive(Clone)]
struct ControlSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ControlSender {
    fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let frame = serde_json::to_vec(message)?;
        self.tx
            .send(frame)
            .map_err(|_| BridgeError::transport_closed("control channel writer has stopped"))
    }
}

/// Forwards extension log records to the peer as `log` notifications.
struct RemoteLogSink {
    sender: ControlSender,
    session: Arc<Session>,
}

impl LogSink for RemoteLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        let notification = RpcRequest::notification("log", vec![json!(level), json!(message)]);
        if self.sender.send(&notification).is_ok() {
            self.session.touch();
        }
    }
}

/// Run the dispatch loop for a freshly paired session until it closes.
///
/// Returns `Ok(())` when the session was cancelled, otherwise the error that
/// ended it.
pub(crate) async fn run(
    session: Arc<Session>,
    comm: TcpStream,
    data: TcpStream,
    resolver: Arc<dyn ExtensionResolver>,
) -> Result<()> {
    let (comm_reader, comm_writer) = comm.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(comm_writer, rx, session.clone()));

    let mut dispatcher = Dispatcher {
        session,
        resolver,
        comm_reader,
        data,
        sender: ControlSender { tx },
        state: DispatchState::Unbound,
        next_reverse_id: 1,
    };

    let outcome = dispatcher.serve().await;

    // Release the extension and every sender clone it holds, then give the
    // writer a moment to flush the last response.
    dispatcher.state = DispatchState::Closed;
    let Dispatcher { sender, mut data, .. } = dispatcher;
    drop(sender);
    let _ = data.shutdown().await;

    if tokio::time::timeout(TransportConfig::WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    match outcome {
        Err(BridgeError::Cancelled) => Ok(()),
        other => other,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    session: Arc<Session>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("Session {}: control write failed: {}", session.id(), e);
            session.cancel_token().cancel();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct Dispatcher {
    session: Arc<Session>,
    resolver: Arc<dyn ExtensionResolver>,
    comm_reader: OwnedReadHalf,
    data: TcpStream,
    sender: ControlSender,
    state: DispatchState,
    next_reverse_id: u64,
}

impl Dispatcher {
    async fn serve(&mut self) -> Result<()> {
        let cancel = self.session.cancel_token().clone();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                frame = read_frame(&mut self.comm_reader) => frame?,
            };

            let request = match RpcMessage::parse(&frame) {
                Ok(RpcMessage::Request(request)) => request,
                Ok(RpcMessage::Response(response)) => {
                    return Err(BridgeError::protocol(format!(
                        "unexpected response with id {:?}",
                        response.id
                    )));
                }
                Err(e) => {
                    let _ = self.sender.send(&RpcResponse::from_error(None, &e));
                    return Err(e);
                }
            };

            let Some(id) = request.id.clone() else {
                return Err(BridgeError::protocol(format!(
                    "notification '{}' is not supported",
                    request.method
                )));
            };

            debug!("Session {}: {} in state {}", self.session.id(), request.method, self.state);

            match self.handle(&request).await {
                Ok(Reply::Value(result)) => {
                    self.sender.send(&RpcResponse::success(Some(id), result))?;
                }
                Ok(Reply::Bulk(payload)) => {
                    self.sender.send(&RpcResponse::success(Some(id), Value::Null))?;
                    payload.write_to(&mut self.data).await?;
                }
                Err(e) if !e.is_session_fatal() => {
                    debug!("Session {}: {} failed: {}", self.session.id(), request.method, e);
                    self.sender.send(&RpcResponse::from_error(Some(id), &e))?;
                }
                Err(e) => {
                    let _ = self.sender.send(&RpcResponse::from_error(Some(id), &e));
                    return Err(e);
                }
            }

            self.session.touch();
        }
    }

    async fn handle(&mut self, request: &RpcRequest) -> Result<Reply> {
        let method = request.method.as_str();
        match method {
            "initialize" => self.initialize(request),
            "upgradeSourceConfiguration" => self.upgrade_source_configuration(request).await,
            "setContext" => self.set_context(request).await,
            "getCatalogRegistrations" => {
                let instance = self.active_instance(method)?;
                let path: String = request.param(0, "path")?;
                let registrations = instance
                    .get_catalog_registrations(&path)
                    .await
                    .map_err(contain)?;
                Ok(Reply::Value(serde_json::to_value(registrations)?))
            }
            "enrichCatalog" => {
                let instance = self.active_instance(method)?;
                let catalog: Value = request.param(0, "catalog")?;
                let enriched = instance.enrich_catalog(catalog).await.map_err(contain)?;
                Ok(Reply::Value(enriched))
            }
            "getTimeRange" => {
                let instance = self.active_instance(method)?;
                let catalog_id: String = request.param(0, "catalogId")?;
                let range = instance.get_time_range(&catalog_id).await.map_err(contain)?;
                Ok(Reply::Value(serde_json::to_value(range)?))
            }
            "getAvailability" => {
                let instance = self.active_instance(method)?;
                let catalog_id: String = request.param(0, "catalogId")?;
                let begin: DateTime<Utc> = request.param(1, "begin")?;
                let end: DateTime<Utc> = request.param(2, "end")?;
                let availability = instance
                    .get_availability(&catalog_id, begin, end)
                    .await
                    .map_err(contain)?;
                Ok(Reply::Value(json!(availability)))
            }
            "readSingle" => self.read_single(request).await,
            _ => Err(BridgeError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    fn initialize(&mut self, request: &RpcRequest) -> Result<Reply> {
        if !matches!(self.state, DispatchState::Unbound) {
            return Err(out_of_state(&request.method, &self.state));
        }

        let type_name: String = request.param(0, "typeName")?;
        let factory = self.resolver.resolve(&type_name)?;

        info!("Session {}: bound to extension '{}'", self.session.id(), factory.type_name());
        self.state = DispatchState::Bound { factory };
        Ok(Reply::Value(json!(TransportConfig::API_LEVEL)))
    }

    async fn upgrade_source_configuration(&mut self, request: &RpcRequest) -> Result<Reply> {
        let factory = match &self.state {
            DispatchState::Bound { factory } | DispatchState::Active { factory, .. } => factory.clone(),
            state => return Err(out_of_state(&request.method, state)),
        };

        let configuration: Value = request.param(0, "configuration")?;
        let mut scratch = factory.create();
        let upgraded = scratch
            .upgrade_source_configuration(configuration)
            .await
            .map_err(contain)?;
        Ok(Reply::Value(upgraded))
    }

    async fn set_context(&mut self, request: &RpcRequest) -> Result<Reply> {
        let DispatchState::Bound { factory } = &self.state else {
            return Err(out_of_state(&request.method, &self.state));
        };
        let factory = factory.clone();

        let context: DataSourceContext = request.param(0, "context")?;
        let logger = ExtensionLogger::new(Arc::new(RemoteLogSink {
            sender: self.sender.clone(),
            session: self.session.clone(),
        }));

        let mut instance = factory.create();
        instance.set_context(context, logger).await.map_err(contain)?;

        debug!("Session {}: context set, serving calls", self.session.id());
        self.state = DispatchState::Active { factory, instance };
        Ok(Reply::Value(Value::Null))
    }

    async fn read_single(&mut self, request: &RpcRequest) -> Result<Reply> {
        let Dispatcher {
            session,
            comm_reader,
            data,
            sender,
            state,
            next_reverse_id,
            ..
        } = self;

        let DispatchState::Active { instance, .. } = &mut *state else {
            return Err(out_of_state(&request.method, state));
        };

        let begin: DateTime<Utc> = request.param(0, "begin")?;
        let end: DateTime<Utc> = request.param(1, "end")?;
        let original_resource_name: String = request.param(2, "originalResourceName")?;
        let catalog_item: CatalogItem = request.param(3, "catalogItem")?;

        let representation = &catalog_item.representation;
        let samples = representation.sample_count(begin, end)?;
        // Raw data pulled through readData travels as f64 regardless of type.
        buffer_length(samples, std::mem::size_of::<f64>())?;
        let mut payload = BulkPayload::zeroed(samples, representation.element_size())?;

        let mut reverse = ReverseReader {
            session: &**session,
            sender,
            comm_reader,
            data,
            next_id: next_reverse_id,
            fatal: None,
        };

        let outcome = instance
            .read(
                begin,
                end,
                ReadRequest {
                    original_resource_name: &original_resource_name,
                    catalog_item: &catalog_item,
                    data: &mut payload.data,
                    status: &mut payload.status,
                },
                &mut reverse,
            )
            .await;

        // A broken reverse exchange leaves the channels out of step even if
        // the extension swallowed the error.
        if let Some(err) = reverse.fatal.take() {
            return Err(err);
        }
        outcome.map_err(contain)?;

        Ok(Reply::Bulk(payload))
    }

    fn active_instance(&mut self, method: &str) -> Result<&mut Box<dyn BoundDataSource>> {
        match &mut self.state {
            DispatchState::Active { instance, .. } => Ok(instance),
            state => Err(out_of_state(method, state)),
        }
    }
}

fn out_of_state(method: &str, state: &DispatchState) -> BridgeError {
    BridgeError::protocol(format!("method '{method}' is not valid in state {state}"))
}

/// Keep a failure raised by extension code local to the call.
fn contain(err: BridgeError) -> BridgeError {
    if err.is_session_fatal() {
        BridgeError::extension(err.to_string())
    } else {
        err
    }
}

/// Pulls raw data from the peer with nested `readData` calls.
struct ReverseReader<'a> {
    session: &'a Session,
    sender: &'a ControlSender,
    comm_reader: &'a mut OwnedReadHalf,
    data: &'a mut TcpStream,
    next_id: &'a mut u64,
    fatal: Option<BridgeError>,
}

impl ReverseReader<'_> {
    async fn exchange(
        &mut self,
        resource_path: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        buffer: &mut [f64],
    ) -> Result<()> {
        self.session.cancel_token().check()?;

        let id = *self.next_id;
        *self.next_id += 1;

        let request = RpcRequest::new(
            "readData",
            vec![json!(resource_path), json!(begin), json!(end)],
            id,
        );
        self.sender.send(&request)?;

        let cancel = self.session.cancel_token();
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            frame = read_frame(&mut *self.comm_reader) => frame?,
        };

        match RpcMessage::parse(&frame)? {
            RpcMessage::Response(response) if response.id == Some(json!(id)) => {
                response.into_result("readData")?;
            }
            RpcMessage::Response(response) => {
                return Err(BridgeError::protocol(format!(
                    "readData response id {:?} does not match request {id}",
                    response.id
                )));
            }
            RpcMessage::Request(other) => {
                return Err(BridgeError::protocol(format!(
                    "unexpected request '{}' while awaiting readData",
                    other.method
                )));
            }
        }

        let expected = buffer.len() * std::mem::size_of::<f64>();
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            bytes = read_buffer_exact(&mut *self.data, expected) => bytes?,
        };
        unpack_f64(&bytes, buffer)?;

        self.session.touch();
        Ok(())
    }
}

#[async_trait]
impl<'a> ReadData for ReverseReader<'a> {
    async fn read_data(
        &mut self,
        resource_path: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        buffer: &mut [f64],
    ) -> Result<()> {
        if let Some(err) = &self.fatal {
            return Err(BridgeError::Other(format!("session is closing: {err}")));
        }

        match self.exchange(resource_path, begin, end, buffer).await {
            Err(err) if err.is_session_fatal() => {
                warn!("Session {}: readData failed: {}", self.session.id(), err);
                let message = err.to_string();
                self.fatal = Some(err);
                Err(BridgeError::Other(message))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contain_keeps_call_local_errors() {
        assert!(matches!(
            contain(BridgeError::Other("db offline".into())),
            BridgeError::Extension { ref message } if message == "db offline"
        ));
        assert!(matches!(
            contain(BridgeError::InvalidParams { message: "x".into() }),
            BridgeError::InvalidParams { .. }
        ));
    }

    #[test]
    fn test_out_of_state_is_protocol_error() {
        let err = out_of_state("getTimeRange", &DispatchState::Unbound);
        assert!(err.is_session_fatal());
        assert_eq!(
            err.to_string(),
            "Protocol error: method 'getTimeRange' is not valid in state Unbound"
        );
    }

    #[tokio::test]
    async fn test_log_sink_sends_notification() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(uuid::Uuid::new_v4()));
        let sink = RemoteLogSink {
            sender: ControlSender { tx },
            session,
        };

        sink.log(LogLevel::Warning, "disk almost full");

        let frame = rx.recv().await.unwrap();
        let RpcMessage::Request(note) = RpcMessage::parse(&frame).unwrap() else {
            panic!("expected a notification");
        };
        assert_eq!(note.method, "log");
        assert!(note.id.is_none());
        assert_eq!(note.params, Some(json!(["Warning", "disk almost full"])));
    }
}
