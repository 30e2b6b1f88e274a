//! # Peer Session
//!
//! One [`Client`] owns one connection to one remote peer: the TCP stream,
//! the local view of the peer's bitfield, and the choke state. A session is
//! created, driven, and dropped by a single worker thread; nothing here is
//! shared.
//!
//! Establishing a session means:
//!
//! 1. TCP connect (15-second timeout).
//! 2. Exchange 68-byte handshakes and verify the protocol string and the
//!    info hash. The remote peer id is not checked.
//! 3. Read the first regular message, which must be the peer's bitfield.
//!
//! Requiring the bitfield first is stricter than BEP-3 demands. Peers that
//! open with `have` messages, or that have nothing and send no bitfield at
//! all, are dropped here; the swarm is large enough that strictness costs
//! little and it keeps the session state machine simple.
//!
//! The client is generic over the stream so the protocol logic can be
//! driven by in-memory streams in tests.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::ProtocolError;
use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::Message;
use crate::peer::Peer;

/// Timeout for the TCP connect itself.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Socket timeout used for the handshake and bitfield exchange.
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// A live session with one remote peer.
pub struct Client<S> {
    /// The remote endpoint, kept for log context.
    peer: Peer,
    /// The connection; exclusively owned by this session.
    stream: S,
    /// Which pieces the peer claims to have, one bit per piece, MSB first.
    bitfield: Vec<u8>,
    /// Whether the peer currently refuses our requests. Starts true.
    choked: bool,
}

impl Client<TcpStream> {
    /// Dial a peer and establish a session.
    ///
    /// Performs the TCP connect, the handshake exchange, and the initial
    /// bitfield read described in the module docs.
    pub fn connect(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
    ) -> Result<Client<TcpStream>, ProtocolError> {
        let addr = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|_| ProtocolError::ClientConnFailed)?;

        // A peer that stalls mid-greeting should not hold the worker
        // hostage; the download loop sets its own timeout later.
        stream
            .set_read_timeout(Some(GREETING_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(GREETING_TIMEOUT)))
            .map_err(|_| ProtocolError::ClientConnFailed)?;

        info!("Connected to peer {}", peer.id);

        Client::from_stream(peer, stream, peer_id, info_hash)
    }

    /// Set read and write timeouts on the underlying socket.
    pub fn set_connection_timeout(&self, secs: u64) -> Result<(), ProtocolError> {
        let timeout = Some(Duration::from_secs(secs));
        self.stream
            .set_read_timeout(timeout)
            .and_then(|_| self.stream.set_write_timeout(timeout))
            .map_err(|_| ProtocolError::ClientConnFailed)
    }
}

impl<S: Read + Write> Client<S> {
    /// Establish a session over an already-open stream.
    ///
    /// Sends our handshake, validates the peer's answer, and stores the
    /// peer's opening bitfield. Fails with [`ProtocolError::BadHandshake`]
    /// on an info-hash mismatch and [`ProtocolError::ClientConnFailed`]
    /// when the first regular message is not a bitfield.
    pub fn from_stream(
        peer: Peer,
        mut stream: S,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
    ) -> Result<Client<S>, ProtocolError> {
        let handshake = Handshake::new(peer_id, info_hash);
        stream
            .write_all(&handshake.encode())
            .map_err(ProtocolError::WriteFailed)?;

        let mut reply = [0; HANDSHAKE_LEN];
        stream
            .read_exact(&mut reply)
            .map_err(ProtocolError::ReadFailed)?;

        let reply = Handshake::decode(&reply)?;
        if reply.info_hash != info_hash {
            return Err(ProtocolError::BadHandshake);
        }

        let mut client = Client {
            peer,
            stream,
            bitfield: vec![],
            choked: true,
        };

        match client.read_message()? {
            Message::Bitfield(bits) => {
                info!("Receive BITFIELD from peer {}", client.peer.id);
                client.bitfield = bits;
            }
            other => {
                warn!(
                    "Peer {} opened with message id {:?} instead of a bitfield",
                    client.peer.id,
                    other.id()
                );
                return Err(ProtocolError::ClientConnFailed);
            }
        }

        Ok(client)
    }

    /// Whether the peer currently refuses our requests.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Record a received CHOKE.
    pub fn read_choke(&mut self) {
        info!("Receive CHOKE from peer {}", self.peer.id);
        self.choked = true;
    }

    /// Record a received UNCHOKE.
    pub fn read_unchoke(&mut self) {
        info!("Receive UNCHOKE from peer {}", self.peer.id);
        self.choked = false;
    }

    /// Look up piece `index` in the peer's bitfield.
    ///
    /// Fails with [`ProtocolError::InvalidPieceIndex`] when the index lies
    /// beyond the bitfield the peer sent.
    pub fn has_piece(&self, index: u32) -> Result<bool, ProtocolError> {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bitfield.len() {
            return Err(ProtocolError::InvalidPieceIndex(index));
        }

        Ok(self.bitfield[byte_index] >> (7 - offset) & 1 != 0)
    }

    /// Mark piece `index` as available, growing the bitfield if the peer
    /// announced a piece beyond what its bitfield covered.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }

        self.bitfield[byte_index] |= 1 << (7 - offset);
    }

    /// Read the next frame from the peer.
    pub fn read_message(&mut self) -> Result<Message, ProtocolError> {
        Message::read_from(&mut self.stream)
    }

    /// Hand back the underlying stream so tests can inspect what was sent.
    #[cfg(test)]
    pub fn into_stream(self) -> S {
        self.stream
    }

    pub fn send_unchoke(&mut self) -> Result<(), ProtocolError> {
        info!("Send UNCHOKE to peer {}", self.peer.id);
        Message::Unchoke.write_to(&mut self.stream)
    }

    pub fn send_interested(&mut self) -> Result<(), ProtocolError> {
        info!("Send INTERESTED to peer {}", self.peer.id);
        Message::Interested.write_to(&mut self.stream)
    }

    #[allow(dead_code)]
    pub fn send_not_interested(&mut self) -> Result<(), ProtocolError> {
        info!("Send NOT_INTERESTED to peer {}", self.peer.id);
        Message::NotInterested.write_to(&mut self.stream)
    }

    /// Tell the peer we now have a verified copy of piece `index`.
    pub fn send_have(&mut self, index: u32) -> Result<(), ProtocolError> {
        info!("Send HAVE for piece {} to peer {}", index, self.peer.id);
        Message::Have { index }.write_to(&mut self.stream)
    }

    /// Ask for `length` bytes of piece `index` starting at `begin`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), ProtocolError> {
        debug!(
            "Send REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer.id
        );
        Message::Request {
            index,
            begin,
            length,
        }
        .write_to(&mut self.stream)
    }

    /// Withdraw an earlier request.
    #[allow(dead_code)]
    pub fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<(), ProtocolError> {
        debug!(
            "Send CANCEL for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer.id
        );
        Message::Cancel {
            index,
            begin,
            length,
        }
        .write_to(&mut self.stream)
    }
}
