//! CLI argument definitions using clap
//!
//! Commands:
//! - blockstore init --config <path>
//! - blockstore append --config <path> --stream <id>
//! - blockstore replay --config <path> --stream <id> [--blocks]
//! - blockstore status --config <path> [--stream <id>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// blockstore - buffered, chained block commits over an append-only ledger
#[derive(Parser, Debug)]
#[command(name = "blockstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data directory, ledger and registry
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./blockstore.json")]
        config: PathBuf,
    },

    /// Enqueue JSON lines from stdin and commit them
    Append {
        /// Path to configuration file
        #[arg(long, default_value = "./blockstore.json")]
        config: PathBuf,

        /// Stream to append to
        #[arg(long)]
        stream: String,
    },

    /// Print the committed history of a stream
    Replay {
        /// Path to configuration file
        #[arg(long, default_value = "./blockstore.json")]
        config: PathBuf,

        /// Stream to replay
        #[arg(long)]
        stream: String,

        /// Print blocks with their positions instead of flat entries
        #[arg(long)]
        blocks: bool,
    },

    /// Verify chains and print their shape
    Status {
        /// Path to configuration file
        #[arg(long, default_value = "./blockstore.json")]
        config: PathBuf,

        /// Only this stream (default: every registered stream)
        #[arg(long)]
        stream: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_append() {
        let cli = Cli::try_parse_from([
            "blockstore",
            "append",
            "--config",
            "/tmp/b.json",
            "--stream",
            "agent-1",
        ])
        .unwrap();
        match cli.command {
            Command::Append { config, stream } => {
                assert_eq!(config, PathBuf::from("/tmp/b.json"));
                assert_eq!(stream, "agent-1");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_status_stream_is_optional() {
        let cli = Cli::try_parse_from(["blockstore", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status { stream: None, .. }));
    }

    #[test]
    fn test_replay_requires_stream() {
        assert!(Cli::try_parse_from(["blockstore", "replay"]).is_err());
    }
}
