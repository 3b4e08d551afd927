//! Command-line surface.
//!
//! Command words and exit codes are stable: `0` success, `2` configuration
//! error, `1` any other failure (see [`crate::error::AppError::exit_code`]).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "vpn-merger", version, about = "Aggregate and rank VPN subscription sources")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full discover → fetch → dedup → test → score → write pipeline.
    Process {
        /// Directory to write output files to (default from OUTPUT_DIR / "output")
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Comma-separated output formats (e.g. "csv,json,clash"); "all" for everything
        #[arg(long, value_delimiter = ',')]
        formats: Vec<String>,

        /// Ignore cached source health and re-probe everything
        #[arg(long)]
        force_refresh: bool,

        /// Override the concurrent fetch/test limit for this run
        #[arg(long)]
        concurrent: Option<usize>,

        /// Override the per-source fetch timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Manage the tracked source list.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Run environment/config checks and report readiness.
    Validate,

    /// Run an external interface surface (not part of the core pipeline).
    Server {
        #[command(subcommand)]
        kind: ServerKind,
    },

    /// Reprobe an existing raw/base64 subscription file and write sorted outputs.
    Retest {
        /// Path to an existing raw or base64-encoded subscription file
        input: PathBuf,

        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SourcesAction {
    /// List every tracked source, grouped by tier.
    List,
    /// Add a new source URL at a given tier (default: experimental).
    Add {
        url: String,
        #[arg(long, default_value = "experimental")]
        tier: String,
    },
    /// Blacklist a source so it is skipped by future runs.
    Blacklist {
        url: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Remove a source from the blacklist.
    Whitelist { url: String },
}

#[derive(Debug, Subcommand)]
pub enum ServerKind {
    /// JSON API surface only.
    Api,
    /// Static web dashboard only.
    Web,
    /// Both API and web surfaces.
    All,
}
