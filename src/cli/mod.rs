//! CLI module for blockstore
//!
//! Provides command-line interface for:
//! - init: Create the data directory and ledger
//! - append: Commit JSON lines from stdin to a stream
//! - replay: Print a stream's character snapshot and history
//! - status: Verify chains and print their shape

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{
    append, append_value, init, init_value, replay, replay_value, run, run_command, status,
    status_value, Config,
};
pub use errors::{CliError, CliErrorCode, CliResult};
