//! # Peer Worker
//!
//! One worker per peer, on its own OS thread. A worker connects, announces
//! interest, then drains the shared task queue: for each piece it requests
//! all blocks with a bounded pipeline, reassembles them, verifies the SHA-1
//! hash, and publishes the result.
//!
//! ## Failure policy
//!
//! Failures are handled at the smallest scope that can recover:
//!
//! - Peer lacks the piece, the 30-second deadline expires, or the hash does
//!   not match: the task goes back on the queue and the worker moves on.
//! - Connection or framing failure: the task in hand goes back on the queue
//!   and the worker exits; the remaining peers absorb its share.
//!
//! Workers never decide on their own that the download is over. They run
//! until the coordinator closes the task queue, so a task requeued at the
//! last moment is always picked up by somebody.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::client::Client;
use crate::error::ProtocolError;
use crate::message::Message;
use crate::peer::Peer;
use crate::piece::{hash_matches, PieceResult, PieceWork};
use crate::queue::WorkQueue;

/// Maximum number of in-flight block requests per peer.
const NB_REQUESTS_MAX: u32 = 5;

/// Size of a requested block (16 KiB), except for a shorter final block.
const BLOCK_SIZE_MAX: u32 = 16384;

/// Wall-clock limit for one piece attempt. Also used as the socket read
/// timeout while downloading, so a silent peer cannot pin the worker past
/// the deadline.
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

const NB_CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything a worker thread needs: its peer, the swarm identity, and the
/// two shared queues.
pub struct Worker {
    peer: Peer,
    peer_id: [u8; 20],
    info_hash: [u8; 20],
    work_queue: Arc<WorkQueue<PieceWork>>,
    results: Arc<WorkQueue<PieceResult>>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
        work_queue: Arc<WorkQueue<PieceWork>>,
        results: Arc<WorkQueue<PieceResult>>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_queue,
            results,
        }
    }

    /// Run the worker until the task queue closes or the peer fails.
    pub fn start_download(&self) {
        let mut client = match self.connect() {
            Some(client) => client,
            None => return,
        };

        if client
            .set_connection_timeout(PIECE_DEADLINE.as_secs())
            .is_err()
        {
            return;
        }

        // Unchoke first, interested second. The order is unusual but valid,
        // and some swarms have only ever seen it this way.
        if client.send_unchoke().is_err() {
            return;
        }
        if client.send_interested().is_err() {
            return;
        }

        while let Some(piece_work) = self.work_queue.pop() {
            match client.has_piece(piece_work.index) {
                Ok(true) => {}
                Ok(false) => {
                    self.work_queue.push(piece_work);
                    continue;
                }
                Err(error) => {
                    warn!("Peer {}: {}", self.peer.id, error);
                    self.work_queue.push(piece_work);
                    continue;
                }
            }

            let mut data = vec![0; piece_work.length as usize];
            match download_piece(&mut client, &piece_work, &mut data) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "Piece {} timed out on peer {}, requeueing",
                        piece_work.index, self.peer.id
                    );
                    self.work_queue.push(piece_work);
                    continue;
                }
                Err(error) => {
                    error!("Peer {} failed: {:#}", self.peer.id, error);
                    // hand the claimed piece back before giving up on this peer
                    self.work_queue.push(piece_work);
                    return;
                }
            }

            if !hash_matches(&data, &piece_work.hash) {
                warn!(
                    "Piece {} from peer {} failed verification, requeueing",
                    piece_work.index, self.peer.id
                );
                self.work_queue.push(piece_work);
                continue;
            }

            debug!(
                "Piece {} downloaded and verified from peer {}",
                piece_work.index, self.peer.id
            );

            if let Err(error) = client.send_have(piece_work.index) {
                warn!(
                    "Could not announce piece {} to peer {}: {}",
                    piece_work.index, self.peer.id, error
                );
            }

            self.results.push(PieceResult::new(piece_work.index, data));
        }
    }

    /// Dial the peer, retrying a few times before writing it off.
    fn connect(&self) -> Option<Client<TcpStream>> {
        for attempt in 1..=NB_CONNECT_RETRIES {
            match Client::connect(self.peer.clone(), self.peer_id, self.info_hash) {
                Ok(client) => return Some(client),
                Err(error) => {
                    debug!(
                        "Connection to peer {} failed (attempt {}/{}): {}",
                        self.peer.id, attempt, NB_CONNECT_RETRIES, error
                    );
                    if attempt < NB_CONNECT_RETRIES {
                        thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
            }
        }

        debug!("Giving up on peer {}", self.peer.id);
        None
    }
}

/// Download one piece into `data`.
///
/// Keeps up to [`NB_REQUESTS_MAX`] block requests in flight while the peer
/// has us unchoked, and copies blocks as they arrive, in whatever order the
/// peer sends them. Returns `Ok(false)` when the deadline expires before
/// the piece completes; the caller decides what to do with the half-filled
/// buffer. A choke does not reset the backlog accounting; requests lost to
/// the choke simply never arrive and the deadline cleans up.
pub fn download_piece<S: Read + Write>(
    client: &mut Client<S>,
    piece_work: &PieceWork,
    data: &mut [u8],
) -> Result<bool> {
    let deadline = Instant::now() + PIECE_DEADLINE;
    let mut downloaded: u32 = 0;
    let mut requested: u32 = 0;
    let mut backlog: u32 = 0;

    while downloaded < piece_work.length {
        // Top up the request pipeline
        if !client.is_choked() {
            while backlog < NB_REQUESTS_MAX && requested < piece_work.length {
                let block_size = BLOCK_SIZE_MAX.min(piece_work.length - requested);
                client.send_request(piece_work.index, requested, block_size)?;
                requested += block_size;
                backlog += 1;
            }
        }

        if Instant::now() > deadline {
            return Ok(false);
        }

        let message = match client.read_message() {
            Ok(message) => message,
            Err(ProtocolError::ReadFailed(error))
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                // socket timeout, not fatal; the deadline check decides
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        match message {
            Message::Piece {
                index,
                begin,
                block,
            } => {
                if index != piece_work.index {
                    return Err(anyhow!(
                        "received block for piece {} while downloading piece {}",
                        index,
                        piece_work.index
                    ));
                }
                let begin = begin as usize;
                let end = begin + block.len();
                if end > data.len() {
                    return Err(anyhow!(
                        "received block past the end of piece {}",
                        piece_work.index
                    ));
                }
                data[begin..end].copy_from_slice(&block);
                downloaded += block.len() as u32;
                // saturating: a stale block from an abandoned attempt must
                // not underflow the counter
                backlog = backlog.saturating_sub(1);
            }
            Message::Choke => client.read_choke(),
            Message::Unchoke => client.read_unchoke(),
            Message::Have { index } => client.set_piece(index),
            _ => {}
        }
    }

    Ok(true)
}
