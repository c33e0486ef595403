//! Snapshot of the operating system's TCP socket table.
//!
//! On Linux the table is read from `/proc/net/tcp` and `/proc/net/tcp6`,
//! which list listening sockets and active connections alike. Other
//! platforms have no table we can read without extra dependencies, so
//! callers fall back to a bind probe per candidate port.

use crate::error::Result;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

/// Whether [`active_tcp_ports`] reflects the real OS table.
pub const SOCKET_TABLE_AVAILABLE: bool = cfg!(target_os = "linux");

/// Local ports of all TCP sockets currently known to the OS.
#[cfg(target_os = "linux")]
pub fn active_tcp_ports() -> Result<HashSet<u16>> {
    let mut ports = HashSet::new();

    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match std::fs::read_to_string(table) {
            Ok(contents) => ports.extend(parse_proc_net_tcp(&contents)),
            // tcp6 is missing when IPv6 is disabled
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not present", table);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ports)
}

/// Local ports of all TCP sockets currently known to the OS.
#[cfg(not(target_os = "linux"))]
pub fn active_tcp_ports() -> Result<HashSet<u16>> {
    Ok(HashSet::new())
}

/// Whether a listener can currently be bound to `port` on all interfaces.
pub fn can_bind(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Extract local ports from the text of a `/proc/net/tcp{,6}` table.
///
/// Each data row has the form `sl local_address rem_address st ...` with
/// the address written as `HEXADDR:HEXPORT`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_net_tcp(contents: &str) -> impl Iterator<Item = u16> + '_ {
    contents.lines().skip(1).filter_map(|line| {
        let local = line.split_whitespace().nth(1)?;
        let (_, port) = local.rsplit_once(':')?;
        u16::from_str_radix(port, 16).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:DB51 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 31212 1
   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 20435 1
   2: 0100007F:C350 0100007F:DB51 01 00000000:00000000 00:00000000 00000000  1000        0 40211 1
";

    #[test]
    fn test_parse_proc_net_tcp() {
        let ports: Vec<u16> = parse_proc_net_tcp(SAMPLE).collect();
        assert_eq!(ports, vec![56145, 22, 50000]);
    }

    #[test]
    fn test_parse_skips_malformed_rows() {
        let contents = "header\n   0: garbage\n   1: 0100007F:ZZZZ 00000000:0000 0A\n";
        assert_eq!(parse_proc_net_tcp(contents).count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshot_contains_bound_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let ports = active_tcp_ports().unwrap();
        assert!(ports.contains(&port));
    }
}
