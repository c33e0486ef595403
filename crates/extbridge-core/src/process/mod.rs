//! Port negotiation and child process management for host-spawned agents.

pub mod launcher;
pub mod ports;

pub use launcher::{resolve_template, LaunchSpec, ProcessHandle, ProcessLauncher};
pub use ports::PortAllocator;
