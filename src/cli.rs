//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use objstore_core::ByteRange;

/// Move objects in and out of HTTP object storage.
///
/// Large uploads go out as parallel multipart uploads; large ranged reads can
/// be split across a priority download pool (see `download_workers` in the
/// config file).
#[derive(Parser, Debug)]
#[command(name = "objstore")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Bucket endpoint, e.g. http://127.0.0.1:9000/bucket/
    #[arg(long, env = "OBJSTORE_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/objstore/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a local file
    Put {
        /// File to upload
        file: PathBuf,
        /// Destination key
        key: String,
        /// Storage class for the new object
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Download an object (or a byte range of it) to a file
    Get {
        /// Object key
        key: String,
        /// Output file
        output: PathBuf,
        /// Inclusive byte range, START-END
        #[arg(long, value_parser = parse_range)]
        range: Option<ByteRange>,
    },

    /// Show object metadata
    Head {
        /// Object key
        key: String,
        /// Print metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy an object from another store into this one
    Migrate {
        /// Key in the source store
        source_key: String,
        /// Key in this store
        dest_key: String,
        /// Source bucket endpoint
        #[arg(long)]
        source_endpoint: String,
        /// Storage class for the new object
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Delete an object
    Delete {
        /// Object key
        key: String,
    },
}

/// Parses an inclusive `START-END` byte range.
pub fn parse_range(value: &str) -> Result<ByteRange, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{value}'"))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid range start '{start}'"))?;
    let end: u64 = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid range end '{end}'"))?;
    if end < start {
        return Err(format!("range end {end} is before start {start}"));
    }
    Ok(ByteRange::new(start, end))
}
