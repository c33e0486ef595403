//! Centralized configuration for the extension bridge.
//!
//! Compile-time defaults live in [`TransportConfig`]. Components that need
//! runtime overrides take a [`ListenerOptions`] or [`ClientOptions`] value
//! built from those defaults.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Transport-level constants.
pub struct TransportConfig;

impl TransportConfig {
    /// Well-known port the agent listens on when nothing else is configured.
    pub const DEFAULT_AGENT_PORT: u16 = 56145;

    /// Protocol version returned by `initialize`.
    pub const API_LEVEL: i32 = 1;

    // Handshake
    pub const SESSION_ID_LENGTH: usize = 36;
    pub const CHANNEL_TAG_LENGTH: usize = 4;
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

    // Session lifetime
    pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);
    pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(600);
    pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(60);
    pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

    // Caller side
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const LAUNCH_READY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const LAUNCH_RETRY_DELAY: Duration = Duration::from_millis(100);
    pub const LAUNCH_ATTEMPTS: u32 = 3;

    // Port negotiation
    pub const PORT_PLACEHOLDER: &'static str = "remote-port";
    pub const PORT_RANGE_MIN: u16 = 49152;
    pub const PORT_RANGE_MAX: u16 = 65535;
}

/// Half-open TCP port range `[min, max)` used for port negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: TransportConfig::PORT_RANGE_MIN,
            max: TransportConfig::PORT_RANGE_MAX,
        }
    }
}

/// Runtime options for the session pairing listener.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub handshake_timeout: Duration,
    pub pairing_timeout: Duration,
    pub liveness_timeout: Duration,
    pub supervisor_interval: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: TransportConfig::HANDSHAKE_TIMEOUT,
            pairing_timeout: TransportConfig::PAIRING_TIMEOUT,
            liveness_timeout: TransportConfig::LIVENESS_TIMEOUT,
            supervisor_interval: TransportConfig::SUPERVISOR_INTERVAL,
        }
    }
}

impl ListenerOptions {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_supervisor_interval(mut self, interval: Duration) -> Self {
        self.supervisor_interval = interval;
        self
    }

    /// Default bind address of the agent.
    pub fn default_addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, TransportConfig::DEFAULT_AGENT_PORT))
    }
}

/// Runtime options for the caller half of a session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub launch_ready_timeout: Duration,
    pub launch_attempts: u32,
    pub port_range: PortRange,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            call_timeout: TransportConfig::CALL_TIMEOUT,
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
            launch_ready_timeout: TransportConfig::LAUNCH_READY_TIMEOUT,
            launch_attempts: TransportConfig::LAUNCH_ATTEMPTS,
            port_range: PortRange::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_launch_ready_timeout(mut self, timeout: Duration) -> Self {
        self.launch_ready_timeout = timeout;
        self
    }

    pub fn with_launch_attempts(mut self, attempts: u32) -> Self {
        self.launch_attempts = attempts.max(1);
        self
    }

    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let listener = ListenerOptions::default();
        assert_eq!(listener.handshake_timeout, Duration::from_secs(1));
        assert_eq!(listener.pairing_timeout, Duration::from_secs(10));
        assert_eq!(listener.liveness_timeout, Duration::from_secs(600));

        let client = ClientOptions::default();
        assert_eq!(client.launch_attempts, 3);
        assert_eq!(client.port_range, PortRange { min: 49152, max: 65535 });
        assert_eq!(ListenerOptions::default_addr().port(), 56145);
    }

    #[test]
    fn test_builders() {
        let options = ListenerOptions::default()
            .with_pairing_timeout(Duration::from_millis(200))
            .with_liveness_timeout(Duration::from_secs(5));
        assert_eq!(options.pairing_timeout, Duration::from_millis(200));
        assert_eq!(options.liveness_timeout, Duration::from_secs(5));

        let client = ClientOptions::default().with_launch_attempts(0);
        assert_eq!(client.launch_attempts, 1);
    }
}
