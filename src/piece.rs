//! # Piece Work Items
//!
//! A torrent file is downloaded piece by piece. [`PieceWork`] is the unit
//! that circulates on the task queue: the piece index, its expected SHA-1
//! hash from the metainfo, and its effective length (the final piece is
//! usually shorter than the nominal piece length). [`PieceResult`] is the
//! verified outcome a worker hands back to the coordinator.
//!
//! A work item and its matching result are never live at the same time: a
//! worker either publishes the result or puts the work item back on the
//! queue.

use boring::sha::Sha1;

/// A piece waiting to be downloaded.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent.
    pub index: u32,
    /// Expected SHA-1 hash of the piece data.
    pub hash: [u8; 20],
    /// Effective length of this piece in bytes.
    pub length: u32,
}

/// A downloaded and verified piece.
#[derive(Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent.
    pub index: u32,
    /// The complete piece data, `length` bytes.
    pub data: Vec<u8>,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}

/// Check a downloaded piece against its expected SHA-1 hash.
pub fn hash_matches(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish() == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-1("hello")
    const HELLO_SHA1: [u8; 20] = [
        0xaa, 0xf4, 0xc6, 0x1d, 0xdc, 0xc5, 0xe8, 0xa2, 0xda, 0xbe, 0xde, 0x0f, 0x3b, 0x48, 0x2c,
        0xd9, 0xae, 0xa9, 0x43, 0x4d,
    ];

    // SHA-1("")
    const EMPTY_SHA1: [u8; 20] = [
        0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60, 0x18,
        0x90, 0xaf, 0xd8, 0x07, 0x09,
    ];

    #[test]
    fn accepts_matching_hash() {
        assert!(hash_matches(b"hello", &HELLO_SHA1));
        assert!(hash_matches(b"", &EMPTY_SHA1));
    }

    #[test]
    fn rejects_corrupted_data() {
        assert!(!hash_matches(b"hellp", &HELLO_SHA1));
        assert!(!hash_matches(b"hello", &EMPTY_SHA1));
    }
}
