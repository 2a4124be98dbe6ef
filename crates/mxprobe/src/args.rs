//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "mxprobe", version, about = "Probe mailbox deliverability over SMTP")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,

    /// JSON configuration file; defaults apply to anything it omits
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Human, global = true)]
    pub format: Format,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Probe addresses given as arguments, in a file, or on stdin
    Probe {
        /// Addresses to probe
        emails: Vec<String>,

        /// Read addresses from a file, one per line
        #[arg(long, short)]
        file: Option<PathBuf>,

        /// Read addresses from stdin, one per line
        #[arg(long)]
        stdin: bool,
    },

    /// Resolve MX, A, AAAA and TXT records for a domain
    Resolve {
        /// Domain to resolve
        domain: String,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// One line per address
    Human,
    /// Pretty-printed JSON
    Json,
}
