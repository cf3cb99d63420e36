//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sitewatchd", version, about = "HTTP outage tracker with diagnostic snapshots")]
pub struct Cli {
    /// Config file (default: /etc/sitewatch/config.toml, then /var/lib/sitewatch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Probe every site once; snapshots run as detached processes
    Tick,

    /// Probe every site on a fixed interval until interrupted
    Run,

    /// Collect the diagnostic snapshot for one resolved outage
    Snapshot {
        #[arg(long)]
        site: String,

        /// Runtime version, e.g. 8.1
        #[arg(long)]
        runtime: String,

        /// Site document root
        #[arg(long)]
        root: PathBuf,

        /// Outage start, YYYY-MM-DD HH:MM:SS (local time)
        #[arg(long)]
        start: String,

        /// Outage end, YYYY-MM-DD HH:MM:SS (local time)
        #[arg(long)]
        end: String,
    },

    /// Show active outages and recent transitions
    Status {
        /// Number of journal entries to show
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
}
