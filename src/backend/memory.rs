//! In-memory ledger and registry.
//!
//! Used by tests and embedders that do not need durability. Both carry
//! fault injection so failure paths can be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::errors::{BackendError, BackendResult};
use super::{IndexRegistry, Ledger, PositionToken, StreamId};

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<Vec<u8>>,
    push_faults: VecDeque<BackendError>,
    outage: Option<BackendError>,
    push_attempts: u64,
}

/// Append-only ledger held in a `Vec`. Positions are `"1"`, `"2"`, ...
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next push with `error`. Faults queue up in call order.
    pub fn fail_next_push(&self, error: BackendError) {
        self.state().push_faults.push_back(error);
    }

    /// Fail every push with `error` until cleared with `None`.
    pub fn set_outage(&self, error: Option<BackendError>) {
        self.state().outage = error;
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of push calls, successful or not
    pub fn push_attempts(&self) -> u64 {
        self.state().push_attempts
    }

    /// Copy of all committed entries in position order
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.state().entries.clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn push(&self, data: Vec<u8>) -> BackendResult<PositionToken> {
        let mut state = self.state();
        state.push_attempts += 1;
        if let Some(error) = state.outage.clone() {
            return Err(error);
        }
        if let Some(error) = state.push_faults.pop_front() {
            return Err(error);
        }
        state.entries.push(data);
        Ok(PositionToken::new(state.entries.len().to_string()))
    }

    async fn fetch(&self, position: &PositionToken) -> BackendResult<Vec<u8>> {
        let index: usize = position
            .as_str()
            .parse()
            .map_err(|_| BackendError::PositionNotFound(position.to_string()))?;
        let state = self.state();
        index
            .checked_sub(1)
            .and_then(|i| state.entries.get(i))
            .cloned()
            .ok_or_else(|| BackendError::PositionNotFound(position.to_string()))
    }
}

#[derive(Debug, Default, Clone)]
struct Pointers {
    blob: Option<PositionToken>,
    character: Option<PositionToken>,
}

#[derive(Debug, Default)]
struct RegistryState {
    streams: HashMap<StreamId, Pointers>,
    read_faults: VecDeque<BackendError>,
    update_faults: VecDeque<BackendError>,
    reject_characters: bool,
}

/// Pointer registry held in a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `get_pointer` call with `error`.
    pub fn fail_next_read(&self, error: BackendError) {
        self.state().read_faults.push_back(error);
    }

    /// Fail the next blob pointer update with `error`.
    pub fn fail_next_update(&self, error: BackendError) {
        self.state().update_faults.push_back(error);
    }

    /// Make character pointer updates return `false`.
    pub fn reject_character_updates(&self, reject: bool) {
        self.state().reject_characters = reject;
    }

    /// Overwrite the blob pointer behind the queue's back.
    pub fn force_pointer(&self, stream: &StreamId, position: Option<PositionToken>) {
        self.state()
            .streams
            .entry(stream.clone())
            .or_default()
            .blob = position;
    }

    /// Current blob pointer, without going through the async trait
    pub fn pointer(&self, stream: &StreamId) -> Option<PositionToken> {
        self.state()
            .streams
            .get(stream)
            .and_then(|p| p.blob.clone())
    }

    /// Current character pointer, without going through the async trait
    pub fn character_pointer(&self, stream: &StreamId) -> Option<PositionToken> {
        self.state()
            .streams
            .get(stream)
            .and_then(|p| p.character.clone())
    }
}

#[async_trait]
impl IndexRegistry for MemoryRegistry {
    async fn get_pointer(&self, stream: &StreamId) -> BackendResult<Option<PositionToken>> {
        let mut state = self.state();
        if let Some(error) = state.read_faults.pop_front() {
            return Err(error);
        }
        Ok(state.streams.get(stream).and_then(|p| p.blob.clone()))
    }

    async fn update_or_register_pointer(
        &self,
        stream: &StreamId,
        expected: Option<&PositionToken>,
        new: &PositionToken,
    ) -> BackendResult<bool> {
        let mut state = self.state();
        if let Some(error) = state.update_faults.pop_front() {
            return Err(error);
        }
        let pointers = state.streams.entry(stream.clone()).or_default();
        if pointers.blob.as_ref() != expected {
            return Ok(false);
        }
        pointers.blob = Some(new.clone());
        Ok(true)
    }

    async fn get_character_pointer(
        &self,
        stream: &StreamId,
    ) -> BackendResult<Option<PositionToken>> {
        Ok(self.character_pointer(stream))
    }

    async fn update_or_register_character_pointer(
        &self,
        stream: &StreamId,
        new: &PositionToken,
    ) -> BackendResult<bool> {
        let mut state = self.state();
        if state.reject_characters {
            return Ok(false);
        }
        state.streams.entry(stream.clone()).or_default().character = Some(new.clone());
        Ok(true)
    }
}
