//! Bootstrap peers.
//!
//! A bootstrap file lists one multiaddr per line; blank lines and `#`
//! comments are skipped. Entries carrying a `/p2p/<peer id>` suffix are
//! also seeded into the Kademlia routing table.

use std::fs;
use std::path::Path;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::{info, warn};

pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let addrs = parse_multiaddrs(content.lines());
            info!(count = addrs.len(), path = %path.display(), "loaded bootstrap peers");
            addrs
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read bootstrap peers");
            Vec::new()
        }
    }
}

/// Parse multiaddrs, skipping comments and logging malformed entries.
pub fn parse_multiaddrs<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Multiaddr> {
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(line = %line, error = %e, "skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_empty() {
        assert!(load_bootstrap_peers(Path::new("/nonexistent/bootstrap.txt")).is_empty());
    }

    #[test]
    fn test_load_skips_comments_and_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# cafes").unwrap();
        writeln!(file, "/ip4/127.0.0.1/udp/4001/quic-v1").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not-an-addr").unwrap();
        writeln!(file, "  /ip4/10.0.0.2/udp/4001/quic-v1  ").unwrap();

        assert_eq!(load_bootstrap_peers(file.path()).len(), 2);
    }

    #[test]
    fn test_peer_id_suffix() {
        let peer = PeerId::random();
        let with: Multiaddr = format!("/ip4/127.0.0.1/udp/4001/quic-v1/p2p/{peer}")
            .parse()
            .unwrap();
        let without: Multiaddr = "/ip4/127.0.0.1/udp/4001/quic-v1".parse().unwrap();

        assert_eq!(peer_id_of(&with), Some(peer));
        assert_eq!(peer_id_of(&without), None);
    }
}
