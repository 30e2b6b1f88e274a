//! # Torrent Metadata and Download Coordination
//!
//! Everything that happens on the main thread lives here: parsing the
//! bencoded `.torrent` file, announcing to the trackers, and running the
//! download to completion.
//!
//! ## Coordination
//!
//! The coordinator seeds a task queue with one [`PieceWork`] per piece,
//! spawns one worker thread per chosen peer, and then drains the result
//! queue, copying each verified piece into a preallocated whole-file
//! buffer at `index * piece_length`. Results arrive in completion order,
//! not index order; the offset math puts them where they belong.
//!
//! Exactly one result is ever produced per piece, so after `num_pieces`
//! results the download is complete; the coordinator then closes the task
//! queue, which is the signal workers exit on. Workers never exit just
//! because the queue looks empty, a failed piece may be requeued at any
//! moment by a dying worker.
//!
//! ## Trackers
//!
//! Multitracker metainfo (announce-list) is supported: every tier is
//! shuffled, all trackers are queried in parallel, and the peer lists are
//! merged and deduplicated by endpoint.

use crate::peer::Peer;
use crate::piece::PieceWork;
use crate::queue::WorkQueue;
use crate::worker::Worker;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Port advertised to trackers; this client does not accept inbound
// connections, but the parameter is mandatory.
const PORT: u16 = 6881;

const SHA1_HASH_SIZE: usize = 20;

/// Azureus-style client tag, followed by a random alphanumeric tail.
const PEER_ID_PREFIX: &[u8; 8] = b"-RM0100-";

/// A parsed torrent, ready to download.
#[derive(Default)]
pub struct Torrent {
    /// Tracker tiers (announce-list), each tier a list of URLs.
    tiers: Vec<Vec<String>>,
    /// SHA-1 of the bencoded info dictionary; identifies the swarm.
    info_hash: [u8; 20],
    /// One expected SHA-1 hash per piece.
    pieces_hashes: Vec<[u8; 20]>,
    /// Nominal piece size; the final piece is usually shorter.
    piece_length: u32,
    /// Total file size in bytes.
    length: u64,
    /// Suggested output filename from the metainfo.
    name: String,
    /// Our identity for this run.
    peer_id: [u8; 20],
    /// Peers discovered through the trackers.
    peers: Vec<Peer>,
}

#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all 20-byte piece hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(rename = "length")]
    length: u64,
    #[serde(rename = "name")]
    name: String,
}

#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: BencodeInfo,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Refresh interval in seconds; unused, we announce once
    #[allow(dead_code)]
    interval: u32,
    // Compact peer list, 6 bytes per peer
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to identify the swarm.
    fn hash(&self) -> Result<[u8; 20]> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish())
    }

    /// Split the concatenated `pieces` blob into one hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<[u8; 20]>> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent piece hashes are malformed"));
        }

        Ok(self
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

/// Generate our 20-byte identity: client tag plus random tail.
fn generate_peer_id() -> [u8; 20] {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);

    let mut rng = rand::thread_rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = CHARSET[rng.gen_range(0..CHARSET.len())];
    }

    peer_id
}

/// Assemble the announce GET for one tracker.
///
/// The info hash and peer id are raw bytes, so the query string is built
/// by hand: `Url`'s own query encoder would mangle them.
fn build_tracker_url(
    info_hash: &[u8; 20],
    announce: &str,
    peer_id: &[u8; 20],
    port: u16,
    length: u64,
) -> Result<String> {
    /// Encode every byte as %XX, the only form trackers reliably accept.
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    let base_url = Url::parse(announce).map_err(|_| anyhow!("could not parse tracker url"))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        length
    );

    let mut url = base_url.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

impl Torrent {
    /// Parse a `.torrent` file and announce to its trackers.
    pub fn open(filepath: &Path) -> Result<Torrent> {
        let mut file = File::open(filepath).map_err(|_| anyhow!("could not open torrent"))?;

        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .map_err(|_| anyhow!("could not read torrent"))?;

        let bencode =
            de::from_bytes::<BencodeTorrent>(&buf).map_err(|_| anyhow!("could not decode torrent"))?;

        // Prefer announce-list, shuffling each tier as BEP 12 asks
        let tiers = if !bencode.announce_list.is_empty() {
            let mut tiers = bencode.announce_list;
            let mut rng = rand::thread_rng();
            for tier in &mut tiers {
                tier.shuffle(&mut rng);
            }
            tiers
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce]]
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        };

        let mut torrent = Torrent {
            tiers,
            info_hash: bencode.info.hash()?,
            pieces_hashes: bencode.info.split_pieces_hashes()?,
            piece_length: bencode.info.piece_length,
            length: bencode.info.length,
            name: bencode.info.name,
            peer_id: generate_peer_id(),
            peers: vec![],
        };
        torrent.peers = torrent.request_peers(PORT)?;

        Ok(torrent)
    }

    /// The suggested output filename from the metainfo.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Announce to every known tracker and merge the peer lists.
    fn request_peers(&self, port: u16) -> Result<Vec<Peer>> {
        let mut unique_urls = HashSet::new();
        for tier in &self.tiers {
            for url in tier {
                unique_urls.insert(url.clone());
            }
        }

        if unique_urls.is_empty() {
            return Err(anyhow!("no tracker URLs available"));
        }

        // Collect compact peer blobs from whichever trackers answer
        let all_peer_blobs = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for tracker_url in unique_urls {
            let info_hash = self.info_hash;
            let peer_id = self.peer_id;
            let length = self.length;
            let all_peer_blobs = Arc::clone(&all_peer_blobs);

            handles.push(thread::spawn(move || {
                let full_url =
                    match build_tracker_url(&info_hash, &tracker_url, &peer_id, port, length) {
                        Ok(url) => url,
                        Err(error) => {
                            debug!("Tracker {}: {}", tracker_url, error);
                            return;
                        }
                    };

                let client = match reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(15))
                    .build()
                {
                    Ok(client) => client,
                    Err(_) => return,
                };

                let response = match client.get(&full_url).send().and_then(|r| r.bytes()) {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        debug!("Tracker {} did not answer: {}", tracker_url, error);
                        return;
                    }
                };

                let tracker = match de::from_bytes::<BencodeTracker>(&response) {
                    Ok(bencode) => bencode,
                    Err(_) => {
                        debug!("Tracker {} sent an unreadable response", tracker_url);
                        return;
                    }
                };

                if let Ok(mut blobs) = all_peer_blobs.lock() {
                    blobs.push(tracker.peers.to_vec());
                }
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }

        let blobs = all_peer_blobs.lock().unwrap();
        let mut all_peers = Vec::new();
        for blob in blobs.iter() {
            match Peer::from_compact(blob) {
                Ok(mut peers) => all_peers.append(&mut peers),
                Err(_) => continue,
            }
        }

        if all_peers.is_empty() {
            return Err(anyhow!("could not get peers from any tracker"));
        }

        // Deduplicate by endpoint, then hand out sequential ids for logging
        let mut seen = HashSet::new();
        let mut peers: Vec<Peer> = Vec::new();
        for peer in all_peers {
            if seen.insert((peer.ip, peer.port)) {
                peers.push(peer);
            }
        }
        for (i, peer) in peers.iter_mut().enumerate() {
            peer.id = i as u32;
        }

        info!("Discovered {} peers", peers.len());

        Ok(peers)
    }

    /// Download the whole file into memory.
    pub fn download(&self) -> Result<Vec<u8>> {
        let nb_pieces = self.pieces_hashes.len();
        println!("Downloading {:?} ({} pieces)", self.name, nb_pieces);

        let work_queue = Arc::new(WorkQueue::new());
        let results = Arc::new(WorkQueue::new());

        for (index, hash) in self.pieces_hashes.iter().enumerate() {
            let index = index as u32;
            work_queue.push(PieceWork::new(index, *hash, self.piece_size(index)));
        }

        // One thread per peer is wasteful on big swarms; cap the pool at
        // twice the core count, and never spawn more workers than pieces.
        let parallelism = thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        let nb_workers = nb_pieces.min(2 * parallelism).min(self.peers.len());
        if nb_workers == 0 {
            return Err(anyhow!("no peers to download from"));
        }

        let mut workers = Vec::with_capacity(nb_workers);
        for peer in self.peers.iter().take(nb_workers).cloned() {
            let worker = Worker::new(
                peer,
                self.peer_id,
                self.info_hash,
                Arc::clone(&work_queue),
                Arc::clone(&results),
            );
            workers.push(thread::spawn(move || worker.start_download()));
        }

        let pb = ProgressBar::new(self.length);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        // Place each completed piece at its offset as it arrives
        let mut data = vec![0; self.length as usize];
        let mut nb_pieces_downloaded = 0;
        while nb_pieces_downloaded < nb_pieces {
            let piece = results
                .pop()
                .ok_or_else(|| anyhow!("result queue closed before the download finished"))?;

            let begin = piece.index as usize * self.piece_length as usize;
            let end = begin + piece.data.len();
            data[begin..end].copy_from_slice(&piece.data);

            nb_pieces_downloaded += 1;
            pb.inc(piece.data.len() as u64);
            pb.println(format!(
                "[{:5.1}%] Downloaded piece #{}. {} of {}",
                100.0 * nb_pieces_downloaded as f64 / nb_pieces as f64,
                piece.index,
                nb_pieces_downloaded,
                nb_pieces
            ));
        }
        pb.finish();

        // Every piece is in; release the workers
        work_queue.close();
        for worker in workers {
            let _ = worker.join();
        }

        Ok(data)
    }

    /// Effective size of piece `index`; the final piece takes whatever is
    /// left of the file.
    fn piece_size(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.length);

        (end - begin) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::{Ipv4Addr, TcpListener};

    use crate::handshake::{Handshake, HANDSHAKE_LEN};
    use crate::message::Message;
    use crate::piece::hash_matches;

    #[test]
    fn piece_size_handles_exact_division() {
        let torrent = Torrent {
            piece_length: 16384,
            length: 49152,
            ..Default::default()
        };

        assert_eq!(torrent.piece_size(0), 16384);
        assert_eq!(torrent.piece_size(1), 16384);
        assert_eq!(torrent.piece_size(2), 16384);
    }

    #[test]
    fn piece_size_shortens_final_piece() {
        let torrent = Torrent {
            piece_length: 32768,
            length: 50000,
            ..Default::default()
        };

        assert_eq!(torrent.piece_size(0), 32768);
        assert_eq!(torrent.piece_size(1), 50000 - 32768);
    }

    #[test]
    fn splits_piece_hashes() {
        let mut pieces = vec![0xAA; 20];
        pieces.extend_from_slice(&[0xBB; 20]);

        let info = BencodeInfo {
            pieces: ByteBuf::from(pieces),
            piece_length: 32768,
            length: 50000,
            name: "file".to_string(),
        };

        let hashes = info.split_pieces_hashes().unwrap();
        assert_eq!(hashes, vec![[0xAA; 20], [0xBB; 20]]);
    }

    #[test]
    fn rejects_ragged_piece_hashes() {
        let info = BencodeInfo {
            pieces: ByteBuf::from(vec![0xAA; 30]),
            piece_length: 32768,
            length: 50000,
            name: "file".to_string(),
        };

        assert!(info.split_pieces_hashes().is_err());
    }

    #[test]
    fn decodes_metainfo_roundtrip() {
        let torrent = BencodeTorrent {
            announce: "http://tracker.example/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![0x42; 40]),
                piece_length: 262144,
                length: 300000,
                name: "artifact.bin".to_string(),
            },
        };

        let encoded = ser::to_bytes(&torrent).unwrap();
        let decoded = de::from_bytes::<BencodeTorrent>(&encoded).unwrap();

        assert_eq!(decoded.announce, torrent.announce);
        assert_eq!(decoded.info.piece_length, 262144);
        assert_eq!(decoded.info.length, 300000);
        assert_eq!(decoded.info.name, "artifact.bin");
        assert_eq!(decoded.info.pieces.len(), 40);
    }

    #[test]
    fn peer_id_has_client_tag_and_random_tail() {
        let peer_id = generate_peer_id();

        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
        assert!(peer_id[8..]
            .iter()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit()));
    }

    #[test]
    fn tracker_url_percent_encodes_binary_fields() {
        let info_hash = [0x12; 20];
        let peer_id = *b"-RM0100-aaaaaaaaaaaa";

        let url = build_tracker_url(
            &info_hash,
            "http://tracker.example/announce",
            &peer_id,
            6881,
            50000,
        )
        .unwrap();

        assert!(url.starts_with("http://tracker.example/announce?"));
        assert!(url.contains(&format!("info_hash={}", "%12".repeat(20))));
        assert!(url.contains("port=6881"));
        assert!(url.contains("left=50000"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn tracker_url_rejects_garbage_announce() {
        assert!(build_tracker_url(&[0; 20], "not a url", &[0; 20], 6881, 1).is_err());
    }

    /// A minimal seed: greets with handshake, full bitfield, and unchoke,
    /// then answers block requests until the client hangs up.
    fn serve_stub_peer(listener: TcpListener, info_hash: [u8; 20], pieces: Vec<Vec<u8>>) {
        let (mut stream, _) = listener.accept().unwrap();

        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).unwrap();
        let theirs = Handshake::decode(&buf).unwrap();
        assert_eq!(theirs.info_hash, info_hash);

        stream
            .write_all(&Handshake::new(*b"-ST0001-eeeeeeeeeeee", info_hash).encode())
            .unwrap();

        let mut bits = vec![0u8; pieces.len().div_ceil(8)];
        for i in 0..pieces.len() {
            bits[i / 8] |= 1 << (7 - (i % 8));
        }
        Message::Bitfield(bits).write_to(&mut stream).unwrap();
        Message::Unchoke.write_to(&mut stream).unwrap();

        loop {
            match Message::read_from(&mut stream) {
                Ok(Message::Request {
                    index,
                    begin,
                    length,
                }) => {
                    let piece = &pieces[index as usize];
                    let block = piece[begin as usize..(begin + length) as usize].to_vec();
                    Message::Piece {
                        index,
                        begin,
                        block,
                    }
                    .write_to(&mut stream)
                    .unwrap();
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    #[test]
    fn downloads_two_piece_torrent_from_stub_peer() {
        let piece_length: u32 = 32768;
        let total_length: u64 = 50000;
        let source: Vec<u8> = (0..total_length).map(|i| (i % 251) as u8).collect();

        let pieces_hashes: Vec<[u8; 20]> = source
            .chunks(piece_length as usize)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finish()
            })
            .collect();

        let info_hash = [0x42; 20];
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stub_pieces: Vec<Vec<u8>> = source
            .chunks(piece_length as usize)
            .map(|chunk| chunk.to_vec())
            .collect();
        let stub = thread::spawn(move || serve_stub_peer(listener, info_hash, stub_pieces));

        let torrent = Torrent {
            tiers: vec![],
            info_hash,
            pieces_hashes: pieces_hashes.clone(),
            piece_length,
            length: total_length,
            name: "stub".to_string(),
            peer_id: generate_peer_id(),
            peers: vec![Peer {
                id: 0,
                ip: Ipv4Addr::LOCALHOST,
                port,
            }],
        };

        let data = torrent.download().unwrap();

        assert_eq!(data.len(), total_length as usize);
        assert_eq!(data, source);
        for (i, chunk) in data.chunks(piece_length as usize).enumerate() {
            assert!(hash_matches(chunk, &pieces_hashes[i]));
        }

        stub.join().unwrap();
    }
}
