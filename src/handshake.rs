//! # BitTorrent Handshake
//!
//! The handshake is the fixed 68-byte prelude both sides send before any
//! regular message:
//!
//! ```text
//! <pstrlen=19><pstr="BitTorrent protocol"><reserved: 8 zero bytes><info_hash: 20><peer_id: 20>
//! ```
//!
//! The info hash ties the connection to one swarm; a peer answering with a
//! different hash is talking about a different torrent and the connection
//! must be dropped. The remote peer id is informational and not validated.

use crate::error::ProtocolError;

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Total size of a standard handshake frame.
pub const HANDSHAKE_LEN: usize = 68;

/// The two fields of a handshake that carry information.
///
/// The protocol string and the reserved bytes are fixed by `encode` and
/// checked by `decode`, so they are not stored.
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent's bencoded info dictionary.
    pub info_hash: [u8; 20],
    /// 20-byte identifier of the sending client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(peer_id: [u8; 20], info_hash: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Serialize into the canonical 68-byte layout, reserved bytes zeroed.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID.as_bytes());
        // buf[20..28] stays zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received handshake.
    ///
    /// Fails with [`ProtocolError::BadHandshake`] unless the frame opens
    /// with `19` followed by the exact protocol string.
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Handshake, ProtocolError> {
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID.as_bytes() {
            return Err(ProtocolError::BadHandshake);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let handshake = Handshake::new([0xAB; 20], [0xCD; 20]);
        let buf = handshake.encode();

        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &[0xCD; 20]);
        assert_eq!(&buf[48..68], &[0xAB; 20]);
    }

    #[test]
    fn decode_roundtrip() {
        let handshake = Handshake::new([7; 20], [9; 20]);
        let decoded = Handshake::decode(&handshake.encode()).unwrap();

        assert_eq!(decoded.peer_id, [7; 20]);
        assert_eq!(decoded.info_hash, [9; 20]);
    }

    #[test]
    fn decode_rejects_bad_pstrlen() {
        let mut buf = Handshake::new([0; 20], [0; 20]).encode();
        buf[0] = 20;

        assert!(matches!(
            Handshake::decode(&buf),
            Err(ProtocolError::BadHandshake)
        ));
    }

    #[test]
    fn decode_rejects_bad_protocol_string() {
        let mut buf = Handshake::new([0; 20], [0; 20]).encode();
        buf[1..20].copy_from_slice(b"BitTorrent protocoX");

        assert!(matches!(
            Handshake::decode(&buf),
            Err(ProtocolError::BadHandshake)
        ));
    }
}
