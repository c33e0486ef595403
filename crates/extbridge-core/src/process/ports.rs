//! TCP port allocation for spawned agents.
//!
//! Allocation is check-then-use: the chosen port may be claimed by another
//! process before the agent binds it. Callers treat a later bind or connect
//! failure as retryable and allocate again.

use crate::config::PortRange;
use crate::error::{BridgeError, Result};
use crate::platform::sockets;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Hands out unused TCP ports, fanning out across the range.
#[derive(Debug)]
pub struct PortAllocator {
    last_issued: Mutex<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub const fn new() -> Self {
        Self {
            last_issued: Mutex::new(0),
        }
    }

    /// Allocate a port in `[range.min, range.max)` that the OS reports unused.
    pub fn allocate(&self, range: PortRange) -> Result<u16> {
        let used = sockets::active_tcp_ports()?;
        self.allocate_with(range, |port| {
            !used.contains(&port) && (sockets::SOCKET_TABLE_AVAILABLE || sockets::can_bind(port))
        })
    }

    /// Allocate a port not contained in `used`.
    pub fn allocate_excluding(&self, range: PortRange, used: &HashSet<u16>) -> Result<u16> {
        self.allocate_with(range, |port| !used.contains(&port))
    }

    fn allocate_with(&self, range: PortRange, is_free: impl Fn(u16) -> bool) -> Result<u16> {
        let exhausted = || BridgeError::PortRangeExhausted {
            min: range.min,
            max: range.max,
        };
        if range.min >= range.max {
            return Err(exhausted());
        }

        // Held for the whole scan so two launches never get the same port.
        let mut last = self
            .last_issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let start = (*last).max(range.min);
        let chosen = (start..range.max)
            .chain(range.min..start.min(range.max))
            .find(|&port| is_free(port))
            .ok_or_else(exhausted)?;

        *last = ((u32::from(chosen) + 1) % u32::from(range.max)) as u16;
        debug!("Allocated port {} (next candidate {})", chosen, *last);
        Ok(chosen)
    }
}

/// Process-wide allocator shared by every launch.
pub fn global() -> &'static PortAllocator {
    static GLOBAL: PortAllocator = PortAllocator::new();
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: u16, max: u16) -> PortRange {
        PortRange { min, max }
    }

    #[test]
    fn test_skips_used_ports() {
        let allocator = PortAllocator::new();
        let used: HashSet<u16> = [50000, 50001].into_iter().collect();

        let port = allocator.allocate_excluding(range(50000, 50010), &used).unwrap();
        assert_eq!(port, 50002);
    }

    #[test]
    fn test_sequential_allocations_differ() {
        let allocator = PortAllocator::new();
        let used = HashSet::new();

        let first = allocator.allocate_excluding(range(50000, 50010), &used).unwrap();
        let second = allocator.allocate_excluding(range(50000, 50010), &used).unwrap();
        assert_eq!(first, 50000);
        assert_eq!(second, 50001);
    }

    #[test]
    fn test_wraps_before_exhausting() {
        let allocator = PortAllocator::new();
        let used: HashSet<u16> = [50001, 50002].into_iter().collect();

        // Issue 50000, leaving the cursor at 50001.
        assert_eq!(allocator.allocate_excluding(range(50000, 50003), &HashSet::new()).unwrap(), 50000);
        // 50001 and 50002 are taken, so the scan wraps back to 50000.
        assert_eq!(allocator.allocate_excluding(range(50000, 50003), &used).unwrap(), 50000);
    }

    #[test]
    fn test_exhausted_range() {
        let allocator = PortAllocator::new();
        let used: HashSet<u16> = (50000..50003).collect();

        let err = allocator.allocate_excluding(range(50000, 50003), &used).unwrap_err();
        assert!(matches!(err, BridgeError::PortRangeExhausted { min: 50000, max: 50003 }));

        let empty = allocator.allocate_excluding(range(50010, 50010), &HashSet::new());
        assert!(empty.is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_allocate_avoids_live_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let max = taken.saturating_add(50);
        if max == taken {
            return;
        }

        let allocator = PortAllocator::new();
        let port = allocator.allocate(range(taken, max)).unwrap();
        assert_ne!(port, taken);
    }
}
