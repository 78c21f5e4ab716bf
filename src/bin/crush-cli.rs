//! Thin external wrapper around the library's public operations.
//!
//! Not part of the core: it contains no placement logic of its own,
//! only `parse`/`map`/`convert`/`encode` calls into `crush`'s public
//! surface, following the `clap`-derive + `anyhow` + `tracing-subscriber`
//! pattern the corpus's own binaries use.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crush-cli")]
#[command(about = "Inspect and drive a CRUSH placement map", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a JSON-shaped map record and print its binary encoding.
    Parse {
        /// Input JSON file ("-" for stdin)
        input: String,
    },
    /// Run a rule against a binary map and print the resulting device ids.
    Map {
        /// Binary map file
        map_file: PathBuf,
        rule_id: u32,
        x: u32,
        replica_count: usize,
    },
    /// Convert a binary map to its JSON-shaped record.
    Convert {
        /// Input binary file ("-" for stdin)
        input: String,
    },
    /// Re-encode a binary map (round-trip, useful for diffing).
    Encode {
        map_file: PathBuf,
    },
}

fn read_bytes(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        fs::read(path).with_context(|| format!("reading {path}"))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Parse { input } => {
            let text = read_bytes(&input)?;
            let record: serde_json::Value = serde_json::from_slice(&text)?;
            let mut map = crush::CrushMap::new();
            crush::parse(&mut map, &record)?;
            io::stdout().write_all(&map.encode())?;
        }
        Commands::Map {
            map_file,
            rule_id,
            x,
            replica_count,
        } => {
            let bytes = Bytes::from(fs::read(&map_file)?);
            let mut buf = bytes;
            let map = crush::CrushMap::decode(&mut buf)?;
            let weights = vec![0x10000u32; map.max_devices.max(0) as usize];
            let mut workspace = crush::Workspace::new(&map);
            let result = crush::map(&map, rule_id, x, replica_count, &weights, &mut workspace, None)?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Commands::Convert { input } => {
            let bytes = Bytes::from(read_bytes(&input)?);
            let record = crush::convert_from_binary(bytes)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Encode { map_file } => {
            let bytes = Bytes::from(fs::read(&map_file)?);
            let mut buf = bytes;
            let map = crush::CrushMap::decode(&mut buf)?;
            io::stdout().write_all(&map.encode())?;
        }
    }

    Ok(())
}
