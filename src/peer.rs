//! # Peer Endpoints
//!
//! Trackers answer an announce with a compact binary peer list: 6 bytes
//! per peer, 4 for the IPv4 address and 2 for the port, both big-endian.
//! This module turns that blob into [`Peer`] values the workers can dial.

use std::io::Cursor;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

const COMPACT_PEER_SIZE: usize = 6;

/// One remote endpoint discovered through a tracker.
#[derive(Clone)]
pub struct Peer {
    /// Sequential id used in log lines, assigned after deduplication.
    pub id: u32,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    /// Parse a compact tracker peer list.
    ///
    /// Fails when the blob length is not a multiple of 6 bytes; a truncated
    /// list means the tracker response cannot be trusted.
    pub fn from_compact(compact: &[u8]) -> Result<Vec<Peer>> {
        if !compact.len().is_multiple_of(COMPACT_PEER_SIZE) {
            return Err(anyhow!("received invalid peers from tracker"));
        }

        let mut peers = Vec::with_capacity(compact.len() / COMPACT_PEER_SIZE);

        for (i, entry) in compact.chunks_exact(COMPACT_PEER_SIZE).enumerate() {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

            let mut port_cursor = Cursor::new(&entry[4..6]);
            let port = port_cursor.read_u16::<BigEndian>()?;

            peers.push(Peer {
                id: i as u32,
                ip,
                port,
            });
        }

        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_list() {
        let compact = [192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
        let peers = Peer::from_compact(&compact).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[0].id, 0);
        assert_eq!(peers[1].ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(peers[1].port, 6882);
        assert_eq!(peers[1].id, 1);
    }

    #[test]
    fn parses_empty_list() {
        assert!(Peer::from_compact(&[]).unwrap().is_empty());
    }

    #[test]
    fn rejects_ragged_list() {
        assert!(Peer::from_compact(&[1, 2, 3, 4]).is_err());
    }
}
