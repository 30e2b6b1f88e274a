//! Protocol-level error types.
//!
//! The wire codec and peer session report typed errors so callers can tell
//! a malformed frame apart from a transport failure. Everything above the
//! session layer (tracker, coordinator, CLI) uses `anyhow` and attaches
//! context as errors bubble up.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The 68-byte handshake had a bad protocol string or info hash.
    #[error("invalid handshake received from peer")]
    BadHandshake,

    /// A frame carried a message id outside the range known to BEP-3.
    #[error("invalid message id {0} received from peer")]
    InvalidMessageId(u8),

    /// A frame's length prefix does not match what its id allows.
    #[error("invalid length {len} for message id {id}")]
    BadMessageLength { id: u8, len: u32 },

    #[error("could not read a complete frame from peer")]
    ReadFailed(#[source] io::Error),

    #[error("could not write frame to peer")]
    WriteFailed(#[source] io::Error),

    /// The session could not be established (TCP, timeouts, or a peer that
    /// did not open with a bitfield).
    #[error("could not establish a session with peer")]
    ClientConnFailed,

    /// A piece index that the peer's bitfield cannot answer for.
    #[error("piece index {0} is outside the peer bitfield")]
    InvalidPieceIndex(u32),
}
