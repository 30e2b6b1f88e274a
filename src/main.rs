//! # Remora BitTorrent Client
//!
//! A command-line BitTorrent leeching client written in Rust.
//!
//! Given a `.torrent` file, remora announces to the trackers, connects to
//! the discovered peers, and downloads every piece in parallel, verifying
//! each one against its SHA-1 hash before assembling the file on disk.
//!
//! ## Usage
//!
//! ```bash
//! remora <torrent_file>
//! remora <torrent_file> -o <output_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, seeds the task
//!   queue, collects verified pieces, writes the output file
//! - **Worker threads**: one per peer, each driving a single connection
//! - **Work queues**: blocking FIFOs carrying piece tasks out to the
//!   workers and completed pieces back

#[macro_use]
extern crate log;

mod client;
mod error;
mod handshake;
mod message;
mod peer;
mod piece;
mod queue;
mod torrent;
mod worker;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;

use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent leeching client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<String>,
}

/// Keep metainfo-supplied names from escaping the working directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    // Parse the metainfo and announce to the trackers
    let torrent = Torrent::open(&PathBuf::from(&args.torrent))?;

    let default_filename = sanitize_filename(torrent.name());
    let output_filename = args.output.as_deref().unwrap_or(&default_filename);
    let output_filepath = PathBuf::from(output_filename);

    if output_filepath.exists() {
        println!("Output file '{}' already exists.", output_filename);
        print!("Do you want to overwrite it? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input != "y" && input != "yes" {
            println!("Download cancelled.");
            return Ok(());
        }
    }

    let data = torrent.download()?;

    // Only touch the filesystem once the download has fully verified
    let mut output_file = File::create(&output_filepath)
        .map_err(|e| anyhow!("could not create output file '{}': {}", output_filename, e))?;
    output_file
        .write_all(&data)
        .map_err(|e| anyhow!("could not write data to file '{}': {}", output_filename, e))?;

    println!("Saved in \"{}\".", output_filename);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
