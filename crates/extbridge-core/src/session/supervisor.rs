//! Periodic reclamation of abandoned and silent sessions.

use super::SessionTable;
use crate::cancel::CancellationToken;
use crate::config::ListenerOptions;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

/// Scans the session table and tears down expired sessions.
///
/// A session expires when it never paired within the pairing timeout, or
/// when it paired but has been idle longer than the liveness timeout.
#[derive(Debug, Clone)]
pub struct LivenessSupervisor {
    sessions: SessionTable,
    options: ListenerOptions,
}

impl LivenessSupervisor {
    pub fn new(sessions: SessionTable, options: ListenerOptions) -> Self {
        Self { sessions, options }
    }

    /// Run one scan. Returns the ids of the sessions that were reclaimed.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let mut reclaimed = Vec::new();

        for session in self.sessions.snapshot().await {
            let reason = if session.is_closed() {
                Some("closed")
            } else if !session.is_paired().await {
                (session.age() > self.options.pairing_timeout).then_some("pairing timeout")
            } else {
                (session.idle_for() > self.options.liveness_timeout).then_some("liveness timeout")
            };

            let Some(reason) = reason else {
                continue;
            };

            if self.sessions.remove_if_same(&session).await {
                warn!("Reclaiming session {} ({})", session.id(), reason);
                session.teardown().await;
                reclaimed.push(session.id());
            }
        }

        reclaimed
    }

    /// Sweep on the configured interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.supervisor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = self.sweep().await;
                        if !reclaimed.is_empty() {
                            debug!("Supervisor reclaimed {} session(s)", reclaimed.len());
                        }
                    }
                }
            }
        })
    }
}
