//! File-backed pointer registry
//!
//! Location: `<data_dir>/registry.json`
//!
//! ```json
//! { "streams": { "agent-1": { "blob": "42", "character": "40" } } }
//! ```
//!
//! Every update rewrites the file through `registry.json.tmp`, fsyncs it and
//! renames it over the original, so a crash leaves either the old or the new
//! mapping. Updates are serialized by a mutex which makes the conditional
//! blob update a true compare-and-swap within this process.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{BackendError, BackendResult};
use super::{IndexRegistry, PositionToken, StreamId};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct StreamPointers {
    #[serde(default)]
    blob: Option<PositionToken>,
    #[serde(default)]
    character: Option<PositionToken>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct RegistryFile {
    #[serde(default)]
    streams: BTreeMap<StreamId, StreamPointers>,
}

/// Pointer registry persisted as a single JSON document.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    state: Mutex<RegistryFile>,
}

fn unavailable(context: &str, path: &Path, err: impl std::fmt::Display) -> BackendError {
    BackendError::RegistryUnavailable(format!("{} {}: {}", context, path.display(), err))
}

impl FileRegistry {
    /// Opens the registry under `data_dir`, creating an empty one if missing.
    pub fn open(data_dir: &Path) -> BackendResult<Self> {
        let path = data_dir.join("registry.json");
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| unavailable("invalid registry", &path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(unavailable("failed to read", &path, e)),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, RegistryFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All streams with a registered pointer
    pub fn streams(&self) -> Vec<StreamId> {
        self.state().streams.keys().cloned().collect()
    }

    fn persist(&self, state: &RegistryFile) -> BackendResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| unavailable("failed to create directory for", &self.path, e))?;
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| unavailable("failed to serialize", &self.path, e))?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = File::create(&tmp_path)
            .map_err(|e| unavailable("failed to create", &tmp_path, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| unavailable("failed to write", &tmp_path, e))?;
        file.sync_all()
            .map_err(|e| unavailable("failed to fsync", &tmp_path, e))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| unavailable("failed to replace", &self.path, e))?;
        Ok(())
    }

    /// Applies `change` to a copy of the state and persists it. The in-memory
    /// state only advances once the file is durable.
    fn update<F>(&self, change: F) -> BackendResult<bool>
    where
        F: FnOnce(&mut RegistryFile) -> bool,
    {
        let mut state = self.state();
        let mut next = state.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next)?;
        *state = next;
        Ok(true)
    }
}

#[async_trait]
impl IndexRegistry for FileRegistry {
    async fn get_pointer(&self, stream: &StreamId) -> BackendResult<Option<PositionToken>> {
        Ok(self.state().streams.get(stream).and_then(|p| p.blob.clone()))
    }

    async fn update_or_register_pointer(
        &self,
        stream: &StreamId,
        expected: Option<&PositionToken>,
        new: &PositionToken,
    ) -> BackendResult<bool> {
        self.update(|state| {
            let pointers = state.streams.entry(stream.clone()).or_default();
            if pointers.blob.as_ref() != expected {
                return false;
            }
            pointers.blob = Some(new.clone());
            true
        })
    }

    async fn get_character_pointer(
        &self,
        stream: &StreamId,
    ) -> BackendResult<Option<PositionToken>> {
        Ok(self
            .state()
            .streams
            .get(stream)
            .and_then(|p| p.character.clone()))
    }

    async fn update_or_register_character_pointer(
        &self,
        stream: &StreamId,
        new: &PositionToken,
    ) -> BackendResult<bool> {
        self.update(|state| {
            state.streams.entry(stream.clone()).or_default().character = Some(new.clone());
            true
        })
    }
}
