//! Extbridge Agent - hosts data-source extensions out of process.
//!
//! This binary runs the pairing listener from extbridge-core with the
//! built-in extensions registered, and serves sessions until Ctrl-C.

mod extensions;

use anyhow::Result;
use clap::Parser;
use extbridge_core::platform::current_platform;
use extbridge_core::{ListenerOptions, PairingListener, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "extbridge-agent")]
#[command(about = "Hosts data-source extensions behind the extbridge transport")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "EXTBRIDGE_AGENT_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, env = "EXTBRIDGE_AGENT_PORT", default_value_t = TransportConfig::DEFAULT_AGENT_PORT)]
    port: u16,

    /// Time allowed for a new connection to send its handshake
    #[arg(long, env = "EXTBRIDGE_AGENT_HANDSHAKE_TIMEOUT_MS", default_value_t = TransportConfig::HANDSHAKE_TIMEOUT.as_millis() as u64)]
    handshake_timeout_ms: u64,

    /// Time allowed for both channels of a session to arrive
    #[arg(long, env = "EXTBRIDGE_AGENT_PAIRING_TIMEOUT_SECS", default_value_t = TransportConfig::PAIRING_TIMEOUT.as_secs())]
    pairing_timeout_secs: u64,

    /// Idle time after which an active session is reclaimed
    #[arg(long, env = "EXTBRIDGE_AGENT_LIVENESS_TIMEOUT_SECS", default_value_t = TransportConfig::LIVENESS_TIMEOUT.as_secs())]
    liveness_timeout_secs: u64,

    /// Interval between supervisor sweeps
    #[arg(long, env = "EXTBRIDGE_AGENT_SUPERVISOR_INTERVAL_SECS", default_value_t = TransportConfig::SUPERVISOR_INTERVAL.as_secs())]
    supervisor_interval_secs: u64,

    /// Enable debug logging
    #[arg(short, long, env = "EXTBRIDGE_AGENT_DEBUG")]
    debug: bool,
}

impl Args {
    fn listener_options(&self) -> ListenerOptions {
        ListenerOptions::default()
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_pairing_timeout(Duration::from_secs(self.pairing_timeout_secs))
            .with_liveness_timeout(Duration::from_secs(self.liveness_timeout_secs))
            .with_supervisor_interval(Duration::from_secs(self.supervisor_interval_secs.max(1)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting extbridge agent ({})", current_platform());

    let registry = extensions::registry();
    info!("Registered extensions: {}", registry.type_names().join(", "));

    let mut handle = PairingListener::bind(
        (args.host.as_str(), args.port),
        Arc::new(registry),
        args.listener_options(),
    )
    .await?;

    // Print port for the parent process to read (intentional stdout for IPC)
    println!("AGENT_PORT={}", handle.port());

    info!("Agent listening on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing sessions");
    handle.shutdown().await;

    Ok(())
}
