//! CLI command implementations
//!
//! Every command loads the config, opens the file-backed ledger and
//! registry under `data_dir`, and prints one JSON response line. The
//! `*_value` functions do the work and return the response data so they can
//! be driven without a terminal.

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::{FileLedger, FileRegistry, PlaintextEncryptor, StreamId};
use crate::block::{MessageKind, Payload};
use crate::observability::{Event, Logger, Severity};
use crate::queue::{BlockStore, QueueConfig};
use crate::replay::{ChainReader, ReplayError};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_json_lines, write_error, write_response};

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory (required)
    pub data_dir: String,

    /// Minimum log severity: trace, info, warn, error, fatal (default: info)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Batching, retry and timeout settings
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from file, then apply `BLOCKSTORE_*` overrides.
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        if let Ok(level) = std::env::var("BLOCKSTORE_LOG_LEVEL") {
            config.log_level = Some(level);
        }
        config.queue = config.queue.with_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        if self.data_dir.trim().is_empty() {
            return Err(CliError::config_error("data_dir must not be empty"));
        }
        self.severity()?;
        self.queue.validate()?;
        Ok(())
    }

    /// Configured minimum log severity
    pub fn severity(&self) -> CliResult<Severity> {
        match &self.log_level {
            Some(level) => level
                .parse()
                .map_err(|_| CliError::config_error(format!("Invalid log_level: '{}'", level))),
            None => Ok(Severity::Info),
        }
    }

    /// Get data directory as Path
    pub fn data_path(&self) -> &Path {
        Path::new(&self.data_dir)
    }
}

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command).map_err(|e| {
        let _ = write_error(e.code_str(), e.message());
        e
    })
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Append { config, stream } => append(&config, &stream),
        Command::Replay {
            config,
            stream,
            blocks,
        } => replay(&config, &stream, blocks),
        Command::Status { config, stream } => status(&config, stream.as_deref()),
    }
}

fn load_config(path: &Path) -> CliResult<Config> {
    let config = Config::load(path)?;
    Logger::set_min_severity(config.severity()?);
    Logger::info(
        Event::ConfigLoaded,
        &[
            ("path", &path.display().to_string()),
            ("data_dir", &config.data_dir),
            ("batch_size", &config.queue.batch_size.to_string()),
        ],
    );
    Ok(config)
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::io_error(format!("Failed to start runtime: {}", e)))
}

/// Check if data directory is initialized
fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join("ledger").join("ledger.log").exists()
}

fn require_initialized(config: &Config) -> CliResult<()> {
    if is_initialized(config.data_path()) {
        Ok(())
    } else {
        Err(CliError::not_initialized())
    }
}

/// File-backed collaborators under `data_dir`
struct FileBackend {
    ledger: Arc<FileLedger>,
    registry: Arc<FileRegistry>,
}

impl FileBackend {
    fn open(config: &Config) -> CliResult<Self> {
        require_initialized(config)?;
        Ok(Self {
            ledger: Arc::new(FileLedger::open(config.data_path())?),
            registry: Arc::new(FileRegistry::open(config.data_path())?),
        })
    }

    fn reader(&self) -> ChainReader {
        ChainReader::new(
            self.ledger.clone(),
            self.registry.clone(),
            Arc::new(PlaintextEncryptor),
        )
    }
}

/// Initialize a new data directory
///
/// Creates the directory and an empty ledger. The registry file appears with
/// the first committed pointer.
pub fn init(config_path: &Path) -> CliResult<()> {
    write_response(init_value(config_path)?)
}

pub fn init_value(config_path: &Path) -> CliResult<Value> {
    let config = load_config(config_path)?;
    let data_dir = config.data_path();

    if is_initialized(data_dir) {
        return Err(CliError::already_initialized());
    }

    fs::create_dir_all(data_dir).map_err(|e| {
        CliError::config_error(format!("Failed to create directory {:?}: {}", data_dir, e))
    })?;
    let ledger = FileLedger::open(data_dir)?;

    Ok(json!({
        "initialized": true,
        "ledger": ledger.path().display().to_string(),
    }))
}

/// One stdin line of `append`
#[derive(Debug, Deserialize)]
struct AppendRequest {
    kind: MessageKind,
    #[serde(default)]
    data: Option<Value>,
    /// Base64 payload, mutually exclusive with `data`
    #[serde(default)]
    bytes: Option<String>,
}

impl AppendRequest {
    fn into_message(self) -> CliResult<(MessageKind, Payload)> {
        let payload = match (self.data, self.bytes) {
            (Some(value), None) => Payload::Json(value),
            (None, Some(encoded)) => Payload::Bytes(
                STANDARD
                    .decode(encoded)
                    .map_err(|e| CliError::io_error(format!("Invalid base64 bytes: {}", e)))?,
            ),
            _ => {
                return Err(CliError::io_error(
                    "Each line needs exactly one of 'data' or 'bytes'",
                ))
            }
        };
        Ok((self.kind, payload))
    }
}

/// Enqueue stdin JSON lines on a stream and commit them
///
/// Input lines: `{"kind": "memory", "data": {...}}` or
/// `{"kind": "...", "bytes": "<base64>"}`. All lines are parsed before
/// anything is enqueued.
pub fn append(config_path: &Path, stream: &str) -> CliResult<()> {
    let stdin = io::stdin();
    write_response(append_value(config_path, stream, stdin.lock())?)
}

pub fn append_value<R: BufRead>(config_path: &Path, stream: &str, input: R) -> CliResult<Value> {
    let config = load_config(config_path)?;
    let backend = FileBackend::open(&config)?;

    let messages = read_json_lines(input)
        .map(|line| {
            let request: AppendRequest = serde_json::from_value(line?)?;
            request.into_message()
        })
        .collect::<CliResult<Vec<_>>>()?;

    let stream = StreamId::new(stream);
    let enqueued = messages.len();
    let runtime = runtime()?;
    let (report, head, metrics) = runtime.block_on(async {
        let store = BlockStore::builder(config.queue.clone())
            .ledger(backend.ledger.clone())
            .registry(backend.registry.clone())
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()?;
        let handle = store.stream(stream.clone());
        for (kind, payload) in messages {
            handle.enqueue(kind, payload);
        }
        let report = handle.shutdown().await?;
        let head = handle.status().last_position;
        Ok::<_, CliError>((report, head, store.metrics().snapshot()))
    })?;

    if let Some(reason) = &report.halted {
        return Err(CliError::commit_failed(reason.clone()));
    }
    if let Some(reason) = &report.worker_error {
        return Err(CliError::commit_failed(format!(
            "commit worker for stream {} stopped: {}",
            stream, reason
        )));
    }
    if !report.unflushed.is_empty() || !report.dead_letters.is_empty() {
        return Err(CliError::commit_failed(format!(
            "{} of {} messages not committed on stream {}",
            report.unflushed.len() + report.dead_letters.len(),
            enqueued,
            stream
        )));
    }

    Ok(json!({
        "stream": stream,
        "enqueued": enqueued,
        "committed_blocks": report.committed_blocks,
        "characters_committed": metrics.characters_committed,
        "characters_superseded": metrics.characters_superseded,
        "head": head,
    }))
}

/// Print a stream's latest character and its history
pub fn replay(config_path: &Path, stream: &str, blocks: bool) -> CliResult<()> {
    write_response(replay_value(config_path, stream, blocks)?)
}

pub fn replay_value(config_path: &Path, stream: &str, blocks: bool) -> CliResult<Value> {
    let config = load_config(config_path)?;
    let reader = FileBackend::open(&config)?.reader();
    let stream = StreamId::new(stream);

    runtime()?.block_on(async {
        let character = reader
            .restore_character(&stream)
            .await?
            .map(|payload| payload_json(&payload));

        let history = if blocks {
            let mut out = Vec::new();
            for replayed in reader.restore_history(&stream).await? {
                let mut entries = Vec::with_capacity(replayed.block.blob.len());
                for entry in &replayed.block.blob {
                    let payload = entry.payload().map_err(ReplayError::from)?;
                    entries.push(entry_json(&entry.msg_type, &payload));
                }
                out.push(json!({
                    "position": replayed.position,
                    "prev": replayed.block.prev,
                    "entries": entries,
                }));
            }
            json!({ "blocks": out })
        } else {
            let entries: Vec<Value> = reader
                .restore_entries(&stream)
                .await?
                .iter()
                .map(|(kind, payload)| entry_json(kind, payload))
                .collect();
            json!({ "entries": entries })
        };

        let mut value = json!({ "stream": stream, "character": character });
        if let (Some(target), Some(source)) = (value.as_object_mut(), history.as_object()) {
            target.extend(source.clone());
        }
        Ok::<_, CliError>(value)
    })
}

/// Verify every stream's chain (or one) and print its shape
pub fn status(config_path: &Path, stream: Option<&str>) -> CliResult<()> {
    write_response(status_value(config_path, stream)?)
}

pub fn status_value(config_path: &Path, stream: Option<&str>) -> CliResult<Value> {
    let config = load_config(config_path)?;
    let backend = FileBackend::open(&config)?;
    let reader = backend.reader();
    let streams = match stream {
        Some(stream) => vec![StreamId::new(stream)],
        None => backend.registry.streams(),
    };

    runtime()?.block_on(async {
        let mut out = Vec::with_capacity(streams.len());
        for stream in streams {
            let summary = reader.verify(&stream).await?;
            out.push(json!({
                "stream": stream,
                "head": summary.head,
                "blocks": summary.blocks,
                "entries": summary.entries,
                "character": summary.character,
            }));
        }
        Ok::<_, CliError>(json!({
            "ledger_records": backend.ledger.len(),
            "streams": out,
        }))
    })
}

fn entry_json(kind: &MessageKind, payload: &Payload) -> Value {
    json!({ "kind": kind, "data": payload_json(payload) })
}

fn payload_json(payload: &Payload) -> Value {
    match payload {
        Payload::Json(value) => value.clone(),
        Payload::Bytes(bytes) => json!({ "$bytes": STANDARD.encode(bytes) }),
    }
}
