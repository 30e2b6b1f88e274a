//! # BitTorrent Peer Wire Messages
//!
//! Framing and parsing for the regular messages exchanged after the
//! handshake. Every frame follows the same layout:
//!
//! ```text
//! <length: u32 big-endian><id: u8><payload: length - 1 bytes>
//! ```
//!
//! A length of zero is the keep-alive and carries neither id nor payload.
//!
//! | ID | Name           | Payload                        |
//! |----|----------------|--------------------------------|
//! | 0  | CHOKE          | empty                          |
//! | 1  | UNCHOKE        | empty                          |
//! | 2  | INTERESTED     | empty                          |
//! | 3  | NOT INTERESTED | empty                          |
//! | 4  | HAVE           | piece index (u32)              |
//! | 5  | BITFIELD       | one bit per piece, MSB first   |
//! | 6  | REQUEST        | index, begin, length (3 x u32) |
//! | 7  | PIECE          | index, begin, block bytes      |
//! | 8  | CANCEL         | index, begin, length (3 x u32) |
//!
//! The codec is generic over [`std::io::Read`] and [`std::io::Write`], so
//! the same code runs against a `TcpStream` and against in-memory buffers.
//! Payload bytes are owned by the returned [`Message`] and freed with it.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::ProtocolError;

/// Upper bound on an accepted frame.
///
/// Large enough for a full 16 KiB block plus headers and for the bitfield
/// of a million-piece torrent; anything bigger is a broken or hostile peer.
const FRAME_LEN_MAX: u32 = 1 << 17;

/// One peer wire message, one variant per protocol id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// The wire id of this message, `None` for the keep-alive.
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Read one complete frame.
    ///
    /// Blocks until the frame is fully available or the stream fails. A
    /// partial read surfaces as [`ProtocolError::ReadFailed`], an id
    /// outside the table as [`ProtocolError::InvalidMessageId`], and a
    /// length that contradicts the id as [`ProtocolError::BadMessageLength`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
        let len = reader
            .read_u32::<BigEndian>()
            .map_err(ProtocolError::ReadFailed)?;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = reader.read_u8().map_err(ProtocolError::ReadFailed)?;

        if len > FRAME_LEN_MAX {
            return Err(ProtocolError::BadMessageLength { id, len });
        }

        let mut payload = vec![0; len as usize - 1];
        reader
            .read_exact(&mut payload)
            .map_err(ProtocolError::ReadFailed)?;

        Message::parse(id, payload)
    }

    /// Interpret an id and its raw payload as a typed message.
    fn parse(id: u8, payload: Vec<u8>) -> Result<Message, ProtocolError> {
        let len = payload.len() as u32 + 1;

        match id {
            0..=3 => {
                if !payload.is_empty() {
                    return Err(ProtocolError::BadMessageLength { id, len });
                }
                Ok(match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                })
            }
            4 => {
                if len != 5 {
                    return Err(ProtocolError::BadMessageLength { id, len });
                }
                let mut cursor = Cursor::new(payload);
                let index = cursor
                    .read_u32::<BigEndian>()
                    .map_err(ProtocolError::ReadFailed)?;
                Ok(Message::Have { index })
            }
            5 => Ok(Message::Bitfield(payload)),
            6 | 8 => {
                if len != 13 {
                    return Err(ProtocolError::BadMessageLength { id, len });
                }
                let mut cursor = Cursor::new(payload);
                let index = cursor
                    .read_u32::<BigEndian>()
                    .map_err(ProtocolError::ReadFailed)?;
                let begin = cursor
                    .read_u32::<BigEndian>()
                    .map_err(ProtocolError::ReadFailed)?;
                let length = cursor
                    .read_u32::<BigEndian>()
                    .map_err(ProtocolError::ReadFailed)?;
                if id == 6 {
                    Ok(Message::Request {
                        index,
                        begin,
                        length,
                    })
                } else {
                    Ok(Message::Cancel {
                        index,
                        begin,
                        length,
                    })
                }
            }
            7 => {
                if len < 9 {
                    return Err(ProtocolError::BadMessageLength { id, len });
                }
                let mut cursor = Cursor::new(&payload[..8]);
                let index = cursor
                    .read_u32::<BigEndian>()
                    .map_err(ProtocolError::ReadFailed)?;
                let begin = cursor
                    .read_u32::<BigEndian>()
                    .map_err(ProtocolError::ReadFailed)?;
                let block = payload[8..].to_vec();
                Ok(Message::Piece {
                    index,
                    begin,
                    block,
                })
            }
            _ => Err(ProtocolError::InvalidMessageId(id)),
        }
    }

    /// Write this message as one frame: length prefix, id, payload.
    ///
    /// The frame is assembled in memory first so it reaches the stream in
    /// a single `write_all` call.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let frame = self.serialize();
        writer.write_all(&frame).map_err(ProtocolError::WriteFailed)
    }

    fn serialize(&self) -> Vec<u8> {
        let (payload_len, id) = match self {
            Message::KeepAlive => return vec![0; 4],
            Message::Choke => (0, 0),
            Message::Unchoke => (0, 1),
            Message::Interested => (0, 2),
            Message::NotInterested => (0, 3),
            Message::Have { .. } => (4, 4),
            Message::Bitfield(bits) => (bits.len(), 5),
            Message::Request { .. } => (12, 6),
            Message::Piece { block, .. } => (8 + block.len(), 7),
            Message::Cancel { .. } => (12, 8),
        };

        let mut frame: Vec<u8> = Vec::with_capacity(5 + payload_len);
        frame.extend_from_slice(&(1 + payload_len as u32).to_be_bytes());
        frame.push(id);

        match self {
            Message::Have { index } => frame.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => frame.extend_from_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                frame.extend_from_slice(&index.to_be_bytes());
                frame.extend_from_slice(&begin.to_be_bytes());
                frame.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                frame.extend_from_slice(&index.to_be_bytes());
                frame.extend_from_slice(&begin.to_be_bytes());
                frame.extend_from_slice(block);
            }
            _ => {}
        }

        frame
    }
}
