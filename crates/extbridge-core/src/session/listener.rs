//! TCP listener that pairs raw connections into sessions.
//!
//! Each accepted connection gets its own task: it reads the handshake,
//! registers the stream with the session for that id and, when the
//! registration completes a pair, spawns the session's dispatcher.
//!
//! # Thread Safety
//!
//! The session table is the only structure shared by connection tasks, the
//! pairing timers and the supervisor. Registration and the pair check for a
//! single id happen under that session's own lock, so one id never gets two
//! dispatchers.

use super::dispatcher;
use super::supervisor::LivenessSupervisor;
use super::{Handshake, Registration, Session, SessionTable};
use crate::cancel::CancellationToken;
use crate::config::ListenerOptions;
use crate::error::{BridgeError, Result};
use crate::extension::ExtensionResolver;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct ListenerStats {
    connections_accepted: AtomicUsize,
    handshakes_rejected: AtomicUsize,
    dispatchers_started: AtomicUsize,
}

struct Shared {
    sessions: SessionTable,
    resolver: Arc<dyn ExtensionResolver>,
    options: ListenerOptions,
    stats: ListenerStats,
    shutdown: CancellationToken,
}

/// Handle to a running listener. Dropping it stops accepting and closes
/// every session.
pub struct PairingListenerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: Option<JoinHandle<()>>,
    supervisor_task: Option<JoinHandle<()>>,
}

impl PairingListenerHandle {
    /// Get the address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.shared.sessions
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.len().await
    }

    pub fn connections_accepted(&self) -> usize {
        self.shared.stats.connections_accepted.load(Ordering::SeqCst)
    }

    pub fn handshakes_rejected(&self) -> usize {
        self.shared.stats.handshakes_rejected.load(Ordering::SeqCst)
    }

    /// Number of dispatchers started since the listener was bound.
    pub fn dispatchers_started(&self) -> usize {
        self.shared.stats.dispatchers_started.load(Ordering::SeqCst)
    }

    /// Stop accepting connections and tear down every session.
    pub async fn shutdown(&mut self) {
        self.shared.shutdown.cancel();

        for task in [self.accept_task.take(), self.supervisor_task.take()]
            .into_iter()
            .flatten()
        {
            let _ = task.await;
        }

        for session in self.shared.sessions.drain().await {
            session.teardown().await;
        }
        info!("Pairing listener on {} shut down", self.addr);
    }
}

impl Drop for PairingListenerHandle {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        for task in [self.accept_task.take(), self.supervisor_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let sessions = self.shared.sessions.clone();
            runtime.spawn(async move {
                for session in sessions.drain().await {
                    session.teardown().await;
                }
            });
        }
    }
}

/// Accepts and pairs session connections.
pub struct PairingListener;

impl PairingListener {
    /// Bind to `addr` and start accepting connections in background tasks.
    ///
    /// The returned handle also owns the liveness supervisor.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        resolver: Arc<dyn ExtensionResolver>,
        options: ListenerOptions,
    ) -> Result<PairingListenerHandle> {
        let listener = TcpListener::bind(addr).await.map_err(|e| BridgeError::Io {
            message: format!("failed to bind pairing listener: {e}"),
            source: Some(e),
        })?;
        let addr = listener.local_addr()?;

        info!("Pairing listener on {}", addr);

        let shared = Arc::new(Shared {
            sessions: SessionTable::new(),
            resolver,
            options: options.clone(),
            stats: ListenerStats::default(),
            shutdown: CancellationToken::new(),
        });

        let supervisor = LivenessSupervisor::new(shared.sessions.clone(), options);
        let supervisor_task = supervisor.spawn(shared.shutdown.clone());
        let accept_task = tokio::spawn(Self::accept_loop(listener, shared.clone()));

        Ok(PairingListenerHandle {
            addr,
            shared,
            accept_task: Some(accept_task),
            supervisor_task: Some(supervisor_task),
        })
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("Pairing listener accept loop stopping");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            shared.stats.connections_accepted.fetch_add(1, Ordering::SeqCst);
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                Self::handle_connection(shared, stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Pairing listener accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream, peer_addr: SocketAddr) {
        let handshake = match Handshake::read_from(&mut stream, shared.options.handshake_timeout).await {
            Ok(handshake) => handshake,
            Err(e) => {
                shared.stats.handshakes_rejected.fetch_add(1, Ordering::SeqCst);
                debug!("Dropping connection from {}: {}", peer_addr, e);
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        debug!(
            "Session {}: {} channel from {}",
            handshake.session_id, handshake.kind, peer_addr
        );

        // A session torn down between lookup and registration is replaced
        // by a fresh one on the second pass.
        for _ in 0..2 {
            if shared.shutdown.is_cancelled() {
                return;
            }

            let (session, created) = shared.sessions.get_or_create(handshake.session_id).await;
            if created {
                Self::spawn_pairing_timer(shared.clone(), session.clone());
            }

            match session.register(handshake.kind, stream).await {
                Registration::Pending | Registration::Displaced => return,
                Registration::Paired { comm, data } => {
                    Self::spawn_dispatcher(shared, session, comm, data);
                    return;
                }
                Registration::Closed(returned) => stream = returned,
            }
        }

        debug!("Session {}: dropping connection for closed session", handshake.session_id);
    }

    fn spawn_pairing_timer(shared: Arc<Shared>, session: Arc<Session>) {
        let timeout = shared.options.pairing_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel_token().cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if !session.is_paired().await && shared.sessions.remove_if_same(&session).await {
                        let err = BridgeError::PairingTimeout {
                            session_id: session.id(),
                            timeout,
                        };
                        warn!("{}", err);
                        session.teardown().await;
                    }
                }
            }
        });
    }

    fn spawn_dispatcher(shared: Arc<Shared>, session: Arc<Session>, comm: TcpStream, data: TcpStream) {
        shared.stats.dispatchers_started.fetch_add(1, Ordering::SeqCst);
        info!("Session {} paired", session.id());

        tokio::spawn(async move {
            // The dispatcher runs extension code, so it gets its own task: a
            // panic there must not skip the cleanup below.
            let run = tokio::spawn(dispatcher::run(
                session.clone(),
                comm,
                data,
                shared.resolver.clone(),
            ));

            match run.await {
                Ok(Ok(())) => info!("Session {} closed", session.id()),
                Ok(Err(BridgeError::TransportClosed { message })) => {
                    info!("Session {} closed by peer: {}", session.id(), message)
                }
                Ok(Err(e)) => warn!("Session {} failed: {}", session.id(), e),
                Err(e) if e.is_panic() => error!("Session {} dispatcher panicked", session.id()),
                Err(e) => warn!("Session {} dispatcher aborted: {}", session.id(), e),
            }

            shared.sessions.remove_if_same(&session).await;
            session.teardown().await;
        });
    }
}
