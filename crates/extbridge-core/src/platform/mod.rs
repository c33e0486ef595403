//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here.
//!
//! - `sockets` - TCP socket table snapshot used for port negotiation

pub mod sockets;

pub use sockets::{active_tcp_ports, can_bind, SOCKET_TABLE_AVAILABLE};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        let platform = current_platform();
        assert!(["linux", "windows", "macos", "unknown"].contains(&platform));
        assert_eq!(SOCKET_TABLE_AVAILABLE, platform == "linux");
    }
}
