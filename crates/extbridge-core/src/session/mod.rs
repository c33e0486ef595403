//! Sessions: two paired TCP connections serving one extension instance.
//!
//! Every raw connection starts with a 40-byte handshake, the 36-character
//! session id followed by a 4-byte channel tag:
//!
//! ```text
//! [36 ASCII bytes: session id]["comm" | "data"]
//! ```
//!
//! The listener registers each connection with the [`Session`] for its id.
//! Once both the control ("comm") and data ("data") channels are present
//! the pair is handed to exactly one dispatcher.

pub mod dispatcher;
pub mod listener;
pub mod supervisor;

pub use listener::{PairingListener, PairingListenerHandle};
pub use supervisor::LivenessSupervisor;

use crate::cancel::CancellationToken;
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Bytes in a handshake: session id plus channel tag.
pub const HANDSHAKE_LENGTH: usize =
    TransportConfig::SESSION_ID_LENGTH + TransportConfig::CHANNEL_TAG_LENGTH;

/// Which half of a session a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Control channel, framed JSON-RPC.
    Comm,
    /// Data channel, framed raw buffers.
    Data,
}

impl ChannelKind {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            ChannelKind::Comm => b"comm",
            ChannelKind::Data => b"data",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"comm" => Some(ChannelKind::Comm),
            b"data" => Some(ChannelKind::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Comm => write!(f, "comm"),
            ChannelKind::Data => write!(f, "data"),
        }
    }
}

/// The fixed-size preamble of every raw connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: Uuid,
    pub kind: ChannelKind,
}

impl Handshake {
    pub fn new(session_id: Uuid, kind: ChannelKind) -> Self {
        Self { session_id, kind }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut bytes = [0u8; HANDSHAKE_LENGTH];
        self.session_id
            .hyphenated()
            .encode_lower(&mut bytes[..TransportConfig::SESSION_ID_LENGTH]);
        bytes[TransportConfig::SESSION_ID_LENGTH..].copy_from_slice(self.kind.tag());
        bytes
    }

    pub fn decode(bytes: &[u8; HANDSHAKE_LENGTH]) -> Result<Self> {
        let (id, tag) = bytes.split_at(TransportConfig::SESSION_ID_LENGTH);

        let session_id = std::str::from_utf8(id)
            .ok()
            .and_then(|id| Uuid::try_parse(id).ok())
            .ok_or_else(|| BridgeError::Handshake {
                message: format!("invalid session id {:?}", String::from_utf8_lossy(id)),
            })?;

        let kind = ChannelKind::from_tag(tag).ok_or_else(|| BridgeError::Handshake {
            message: format!("invalid channel tag {:?}", String::from_utf8_lossy(tag)),
        })?;

        Ok(Self { session_id, kind })
    }

    /// Read and decode a handshake, giving up after `timeout`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, timeout: Duration) -> Result<Self> {
        let mut bytes = [0u8; HANDSHAKE_LENGTH];
        match tokio::time::timeout(timeout, reader.read_exact(&mut bytes)).await {
            Ok(Ok(_)) => Self::decode(&bytes),
            Ok(Err(e)) => Err(BridgeError::Handshake {
                message: format!("connection ended during handshake: {e}"),
            }),
            Err(_) => Err(BridgeError::Handshake {
                message: format!("no handshake within {timeout:?}"),
            }),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[derive(Default)]
struct ChannelSlots {
    comm: Option<TcpStream>,
    data: Option<TcpStream>,
    dispatcher_started: bool,
}

/// Outcome of registering a connection with a session.
pub(crate) enum Registration {
    /// The other half has not arrived yet.
    Pending,
    /// Both halves are present; the caller must start the dispatcher.
    Paired { comm: TcpStream, data: TcpStream },
    /// The session already has a dispatcher; the connection displaced one
    /// of its channels and the session is being closed.
    Displaced,
    /// The session was already torn down; the connection is handed back.
    Closed(TcpStream),
}

/// One logical connection between a caller and one extension instance.
pub struct Session {
    id: Uuid,
    created_at: Instant,
    slots: tokio::sync::Mutex<ChannelSlots>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub fn new(id: Uuid) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            slots: tokio::sync::Mutex::new(ChannelSlots::default()),
            last_activity: Mutex::new(now),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time since the first connection for this id arrived.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record a successful exchange.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last successful exchange.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Whether a dispatcher has been started for this session.
    pub async fn is_paired(&self) -> bool {
        self.slots.lock().await.dispatcher_started
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach a connection and run the pair check in one exclusive section.
    pub(crate) async fn register(&self, kind: ChannelKind, stream: TcpStream) -> Registration {
        let mut slots = self.slots.lock().await;
        if self.is_closed() {
            return Registration::Closed(stream);
        }

        let slot = match kind {
            ChannelKind::Comm => &mut slots.comm,
            ChannelKind::Data => &mut slots.data,
        };
        if slot.replace(stream).is_some() {
            debug!("Session {}: {} channel replaced by newer connection", self.id, kind);
        }

        if slots.dispatcher_started {
            // The running dispatcher owns the displaced stream; cancelling
            // the session is the only way to close it.
            debug!("Session {}: {} channel displaced while active", self.id, kind);
            self.cancel.cancel();
            return Registration::Displaced;
        }

        if slots.comm.is_some() && slots.data.is_some() {
            if let (Some(comm), Some(data)) = (slots.comm.take(), slots.data.take()) {
                slots.dispatcher_started = true;
                self.touch();
                return Registration::Paired { comm, data };
            }
        }
        Registration::Pending
    }

    /// Close the session: cancel its loop and drop any parked channels.
    ///
    /// Only the first call has an effect.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let mut slots = self.slots.lock().await;
        for mut stream in [slots.comm.take(), slots.data.take()].into_iter().flatten() {
            let _ = stream.shutdown().await;
        }
        debug!("Session {} torn down", self.id);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Concurrent map of live sessions by id.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the session for `id`, creating it if absent or closed.
    ///
    /// Returns the session and whether it was newly created.
    pub async fn get_or_create(&self, id: Uuid) -> (Arc<Session>, bool) {
        if let Some(session) = self.sessions.read().await.get(&id) {
            if !session.is_closed() {
                return (session.clone(), false);
            }
        }

        let mut sessions = self.sessions.write().await;
        match sessions.get(&id) {
            Some(session) if !session.is_closed() => (session.clone(), false),
            _ => {
                let session = Arc::new(Session::new(id));
                sessions.insert(id, session.clone());
                (session, true)
            }
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove `session` unless its id has since been taken by a newer one.
    pub async fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const ID: &str = "11111111-1111-1111-1111-111111111111";

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn test_handshake_encoding() {
        let handshake = Handshake::new(Uuid::parse_str(ID).unwrap(), ChannelKind::Data);
        let bytes = handshake.encode();
        assert_eq!(&bytes[..36], ID.as_bytes());
        assert_eq!(&bytes[36..], b"data");
        assert_eq!(Handshake::decode(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_handshake_rejects_bad_input() {
        let mut bytes = Handshake::new(Uuid::new_v4(), ChannelKind::Comm).encode();
        bytes[36..].copy_from_slice(b"ctrl");
        assert!(matches!(Handshake::decode(&bytes), Err(BridgeError::Handshake { .. })));

        let mut bytes = [b'x'; HANDSHAKE_LENGTH];
        bytes[36..].copy_from_slice(b"comm");
        assert!(matches!(Handshake::decode(&bytes), Err(BridgeError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_handshake_read_times_out() {
        let (_client, mut server) = socket_pair().await;
        let result = Handshake::read_from(&mut server, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BridgeError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_register_pairs_once() {
        let session = Session::new(Uuid::new_v4());
        let (_c1, comm) = socket_pair().await;
        let (_c2, data) = socket_pair().await;
        let (_c3, extra) = socket_pair().await;

        assert!(matches!(session.register(ChannelKind::Comm, comm).await, Registration::Pending));
        assert!(!session.is_paired().await);
        assert!(matches!(
            session.register(ChannelKind::Data, data).await,
            Registration::Paired { .. }
        ));
        assert!(session.is_paired().await);

        assert!(matches!(
            session.register(ChannelKind::Comm, extra).await,
            Registration::Displaced
        ));
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_replaced_channel_is_closed() {
        let session = Session::new(Uuid::new_v4());
        let (mut stale_client, first) = socket_pair().await;
        let (_c2, second) = socket_pair().await;

        session.register(ChannelKind::Comm, first).await;
        session.register(ChannelKind::Comm, second).await;

        let mut buf = [0u8; 1];
        let read = stale_client.read(&mut buf).await.unwrap();
        assert_eq!(read, 0, "displaced stream should be closed");
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let session = Session::new(Uuid::new_v4());
        let (mut client, comm) = socket_pair().await;
        session.register(ChannelKind::Comm, comm).await;

        session.teardown().await;
        session.teardown().await;

        assert!(session.is_closed());
        assert!(session.cancel_token().is_cancelled());
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        let (_c, late) = socket_pair().await;
        assert!(matches!(
            session.register(ChannelKind::Data, late).await,
            Registration::Closed(_)
        ));
    }

    #[tokio::test]
    async fn test_table_replaces_closed_sessions() {
        let table = SessionTable::new();
        let id = Uuid::new_v4();

        let (first, created) = table.get_or_create(id).await;
        assert!(created);
        let (again, created) = table.get_or_create(id).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &again));

        first.teardown().await;
        let (fresh, created) = table.get_or_create(id).await;
        assert!(created);
        assert!(!table.remove_if_same(&first).await);
        assert!(table.remove_if_same(&fresh).await);
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_tracking() {
        let session = Session::new(Uuid::new_v4());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(session.idle_for(), Duration::from_secs(5));

        session.touch();
        assert_eq!(session.idle_for(), Duration::ZERO);
        assert_eq!(session.age(), Duration::from_secs(5));
    }
}
