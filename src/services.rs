//! Server-port bitmaps.
//!
//! Two 65,536-bit vectors, one per transport protocol, mark which destination
//! ports count as "server ports". Port mode consults them directly; the
//! auto-mode learner uses them to turn destination-port observations into
//! client/server evidence. A destination port with its bit set means the
//! *source* of the packet is acting as a client; a clear bit means the source
//! is acting as a server.

use bitvec::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use std::path::Path;
use std::sync::LazyLock;

use crate::PrepError;
use crate::decode::{IPPROTO_TCP, IPPROTO_UDP};

/// Number of ports per transport protocol.
pub const NUM_PORTS: usize = 65536;

/// Inclusive lower bound of the default server-port range.
pub const DEFAULT_LOW_SERVER_PORT: u16 = 0;
/// Inclusive upper bound of the default server-port range (well-known ports).
pub const DEFAULT_HIGH_SERVER_PORT: u16 = 1023;

/// One bit per port.
type PortVec = BitArr!(for 65536, in u64, Msb0);

/// Matches the `port/proto` notation of an /etc/services line.
static SERVICE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([0-9]+)/(tcp|udp)").expect("static regex"));

/// Transport protocols that carry ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// Maps an IP protocol number to a transport, if it is one we track.
    pub fn from_protocol(protocol: u8) -> Option<Transport> {
        match protocol {
            IPPROTO_TCP => Some(Transport::Tcp),
            IPPROTO_UDP => Some(Transport::Udp),
            _ => None,
        }
    }
}

/// The per-protocol server-port bitmaps.
#[derive(Debug, Clone)]
pub struct ServicePortTable {
    tcp: PortVec,
    udp: PortVec,
}

impl Default for ServicePortTable {
    /// A table with the well-known range marked on both protocols.
    fn default() -> Self {
        let mut table = Self {
            tcp: BitArray::ZERO,
            udp: BitArray::ZERO,
        };
        table.reset_to_default_range();
        table
    }
}

impl ServicePortTable {
    /// True if `port` is marked as a server port for `transport`.
    pub fn is_server_port(&self, transport: Transport, port: u16) -> bool {
        match transport {
            Transport::Tcp => self.tcp[port as usize],
            Transport::Udp => self.udp[port as usize],
        }
    }

    /// Marks or clears a single port.
    pub fn set(&mut self, transport: Transport, port: u16, is_server: bool) {
        let bits = match transport {
            Transport::Tcp => &mut self.tcp,
            Transport::Udp => &mut self.udp,
        };
        bits.set(port as usize, is_server);
    }

    /// Clears both bitmaps and re-marks the default well-known range.
    pub fn reset_to_default_range(&mut self) {
        self.clear();
        for port in DEFAULT_LOW_SERVER_PORT..=DEFAULT_HIGH_SERVER_PORT {
            self.set(Transport::Tcp, port, true);
            self.set(Transport::Udp, port, true);
        }
    }

    fn clear(&mut self) {
        self.tcp = BitArray::ZERO;
        self.udp = BitArray::ZERO;
    }

    /// Rebuilds both bitmaps from a services file.
    ///
    /// Every line containing `port/tcp` or `port/udp` marks that port; all
    /// other lines are ignored. Both bitmaps are cleared first, so the file
    /// fully replaces the default range.
    pub fn load_services_file(&mut self, path: &Path) -> Result<(), PrepError> {
        let text = std::fs::read_to_string(path).map_err(|e| PrepError::ServicesFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        self.clear();
        let mut marked = 0usize;
        for line in text.lines() {
            let Some(captures) = SERVICE_LINE.captures(line) else {
                continue;
            };
            let Ok(port) = captures[1].parse::<u16>() else {
                debug!(line, "service port out of range, skipping");
                continue;
            };
            // The regex matches the line shape case-insensitively, but only
            // the exact lowercase tokens name a protocol we track.
            let transport = match &captures[2] {
                "tcp" => Transport::Tcp,
                "udp" => Transport::Udp,
                other => {
                    warn!(port, protocol = other, "skipping unknown protocol service");
                    continue;
                }
            };
            trace!(port, ?transport, "marking server port");
            self.set(transport, port, true);
            marked += 1;
        }
        debug!(path = %path.display(), marked, "loaded services file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_range_is_marked() {
        let table = ServicePortTable::default();
        assert!(table.is_server_port(Transport::Tcp, 0));
        assert!(table.is_server_port(Transport::Tcp, 80));
        assert!(table.is_server_port(Transport::Udp, 1023));
        assert!(!table.is_server_port(Transport::Tcp, 1024));
        assert!(!table.is_server_port(Transport::Udp, 40000));
    }

    #[test]
    fn set_and_reset() {
        let mut table = ServicePortTable::default();
        table.set(Transport::Tcp, 8080, true);
        table.set(Transport::Tcp, 80, false);
        assert!(table.is_server_port(Transport::Tcp, 8080));
        assert!(!table.is_server_port(Transport::Tcp, 80));
        table.reset_to_default_range();
        assert!(!table.is_server_port(Transport::Tcp, 8080));
        assert!(table.is_server_port(Transport::Tcp, 80));
    }

    #[test]
    fn services_file_replaces_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment lines are ignored").unwrap();
        writeln!(file, "http\t\t80/tcp\t\twww").unwrap();
        writeln!(file, "domain\t\t53/udp").unwrap();
        writeln!(file, "radmin\t\t4899/TCP").unwrap();
        writeln!(file, "not a service line").unwrap();
        writeln!(file, "bogus\t\t99999/tcp").unwrap();

        let mut table = ServicePortTable::default();
        table.load_services_file(file.path()).unwrap();

        assert!(table.is_server_port(Transport::Tcp, 80));
        assert!(table.is_server_port(Transport::Udp, 53));
        // uppercase protocol tokens are skipped as unknown protocols
        assert!(!table.is_server_port(Transport::Tcp, 4899));
        // defaults were cleared, so unlisted well-known ports are gone
        assert!(!table.is_server_port(Transport::Tcp, 22));
        assert!(!table.is_server_port(Transport::Udp, 80));
    }

    #[test]
    fn missing_services_file_is_an_error() {
        let mut table = ServicePortTable::default();
        let err = table
            .load_services_file(Path::new("/nonexistent/services"))
            .unwrap_err();
        assert!(matches!(err, PrepError::ServicesFile { .. }));
    }

    #[test]
    fn transport_from_protocol() {
        assert_eq!(Transport::from_protocol(6), Some(Transport::Tcp));
        assert_eq!(Transport::from_protocol(17), Some(Transport::Udp));
        assert_eq!(Transport::from_protocol(1), None);
    }
}
