//! Neighbour lookups through the kernel ARP table

use std::net::IpAddr;
use std::path::PathBuf;
use tracing::debug;

/// Kernel ARP cache.
pub const PROC_NET_ARP: &str = "/proc/net/arp";

const INCOMPLETE_MAC: &str = "00:00:00:00:00:00";

/// Resolves client IPs to MACs from an ARP cache file.
#[derive(Debug, Clone)]
pub struct ArpTable {
    path: PathBuf,
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new(PROC_NET_ARP)
    }
}

impl ArpTable {
    /// Table read from `path` instead of [`PROC_NET_ARP`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// MAC address the kernel has cached for `ip`.
    pub async fn find_mac(&self, ip: IpAddr) -> Option<String> {
        let path = self.path.clone();
        let table = tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
            .await
            .ok()?;
        match table {
            Ok(table) => parse_arp_table(&table, ip),
            Err(e) => {
                debug!("Unable to read ARP table {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// Looks `ip` up in `/proc/net/arp` content:
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 10.0.0.9         0x1         0x2         52:54:00:12:34:56     *        eth0
/// ```
pub fn parse_arp_table(table: &str, ip: IpAddr) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.as_slice() {
            [addr, _, _, mac, ..] if addr.parse::<IpAddr>().ok() == Some(ip) && *mac != INCOMPLETE_MAC => {
                Some(mac.to_lowercase())
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = "IP address       HW type     Flags       HW address            Mask     Device\n\
        10.0.0.9         0x1         0x2         52:54:00:AB:CD:EF     *        eth0\n\
        10.0.0.10        0x1         0x0         00:00:00:00:00:00     *        eth0\n";

    #[test]
    fn test_parse_arp_table() {
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(parse_arp_table(TABLE, ip).as_deref(), Some("52:54:00:ab:cd:ef"));
        assert_eq!(parse_arp_table(TABLE, "10.0.0.10".parse().unwrap()), None);
        assert_eq!(parse_arp_table(TABLE, "10.0.0.11".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_find_mac_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();
        let table = ArpTable::new(file.path());
        assert_eq!(
            table.find_mac("10.0.0.9".parse().unwrap()).await.as_deref(),
            Some("52:54:00:ab:cd:ef")
        );
        assert_eq!(ArpTable::new("/nonexistent/arp").find_mac("10.0.0.9".parse().unwrap()).await, None);
    }
}
