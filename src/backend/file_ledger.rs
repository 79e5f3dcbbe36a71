//! File-backed append-only ledger
//!
//! Layout: `<data_dir>/ledger/ledger.log`, a sequence of records
//!
//! ```text
//! | len: u32 | seq: u64 | payload_len: u32 | payload | crc32: u32 |
//! ```
//!
//! All integers little endian. `len` counts the whole record including
//! itself and the checksum; the checksum covers everything before it.
//! Sequence numbers start at 1 and increase by exactly one. Every append is
//! fsynced before its position is returned. A failed append is truncated
//! away before the error is returned; if that truncation fails too, the
//! ledger refuses further appends. Any corruption found while opening the
//! ledger is fatal: no records are skipped or repaired.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::checksum::{compute_checksum, verify_checksum};
use super::errors::{BackendError, BackendResult};
use super::{Ledger, PositionToken};

/// len + seq + payload_len + crc
const RECORD_OVERHEAD: usize = 4 + 8 + 4 + 4;

struct LedgerFile {
    file: File,
    /// Byte offset of each record; record `seq` lives at `offsets[seq - 1]`
    offsets: Vec<u64>,
    end_offset: u64,
    /// Set when a failed append could not be rolled back
    poisoned: Option<String>,
    #[cfg(test)]
    fault: Option<WriteFault>,
}

/// Injected append failures
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
enum WriteFault {
    /// Half the record reaches the file, then the write fails
    Partial,
    /// The whole record is written but fsync fails
    Sync,
}

impl LedgerFile {
    #[cfg(not(test))]
    fn write_record(&mut self, record: &[u8]) -> Result<(), String> {
        self.file.write_all(record).map_err(|e| e.to_string())?;
        self.file.sync_all().map_err(|e| format!("fsync failed: {}", e))
    }

    #[cfg(test)]
    fn write_record(&mut self, record: &[u8]) -> Result<(), String> {
        match self.fault.take() {
            Some(WriteFault::Partial) => {
                self.file
                    .write_all(&record[..record.len() / 2])
                    .map_err(|e| e.to_string())?;
                Err("injected short write".to_string())
            }
            Some(WriteFault::Sync) => {
                self.file.write_all(record).map_err(|e| e.to_string())?;
                Err("fsync failed: injected".to_string())
            }
            None => {
                self.file.write_all(record).map_err(|e| e.to_string())?;
                self.file.sync_all().map_err(|e| format!("fsync failed: {}", e))
            }
        }
    }

    /// Cuts the file back to the last complete record.
    fn roll_back(&mut self) -> io::Result<()> {
        self.file.set_len(self.end_offset)?;
        self.file.sync_all()
    }
}

/// Append-only ledger stored in a single checksummed log file.
pub struct FileLedger {
    path: PathBuf,
    inner: Mutex<LedgerFile>,
}

impl std::fmt::Debug for FileLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLedger").field("path", &self.path).finish()
    }
}

fn encode_record(seq: u64, payload: &[u8]) -> Vec<u8> {
    let record_length = (RECORD_OVERHEAD + payload.len()) as u32;
    let mut record = Vec::with_capacity(record_length as usize);
    record.extend_from_slice(&record_length.to_le_bytes());
    record.extend_from_slice(&seq.to_le_bytes());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(payload);
    let checksum = compute_checksum(&record);
    record.extend_from_slice(&checksum.to_le_bytes());
    record
}

/// Parses one full record, returning `(seq, payload)`.
fn decode_record(record: &[u8]) -> Result<(u64, Vec<u8>), String> {
    if record.len() < RECORD_OVERHEAD {
        return Err(format!("record too short: {} bytes", record.len()));
    }
    let body_end = record.len() - 4;
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&record[body_end..]);
    if !verify_checksum(&record[..body_end], u32::from_le_bytes(crc)) {
        return Err("checksum mismatch".to_string());
    }

    let mut seq = [0u8; 8];
    seq.copy_from_slice(&record[4..12]);
    let mut payload_len = [0u8; 4];
    payload_len.copy_from_slice(&record[12..16]);
    let payload_len = u32::from_le_bytes(payload_len) as usize;
    if 16 + payload_len != body_end {
        return Err(format!(
            "payload length {} does not match record length {}",
            payload_len,
            record.len()
        ));
    }
    Ok((u64::from_le_bytes(seq), record[16..body_end].to_vec()))
}

/// Reads the record at `offset`; `remaining` is the number of bytes in the
/// file from `offset` on.
fn read_record_at(file: &mut File, offset: u64, remaining: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let record_length = u32::from_le_bytes(len_buf) as usize;
    if record_length < RECORD_OVERHEAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid record length {}", record_length),
        ));
    }
    if record_length as u64 > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "record length {} exceeds remaining {} bytes",
                record_length, remaining
            ),
        ));
    }
    let mut record = vec![0u8; record_length];
    record[..4].copy_from_slice(&len_buf);
    file.read_exact(&mut record[4..])?;
    Ok(record)
}

impl FileLedger {
    /// Opens or creates the ledger under `data_dir`, validating every record.
    pub fn open(data_dir: &Path) -> BackendResult<Self> {
        let ledger_dir = data_dir.join("ledger");
        let path = ledger_dir.join("ledger.log");

        fs::create_dir_all(&ledger_dir).map_err(|e| {
            BackendError::LedgerUnavailable(format!(
                "failed to create ledger directory {}: {}",
                ledger_dir.display(),
                e
            ))
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                BackendError::LedgerUnavailable(format!(
                    "failed to open ledger {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let (offsets, end_offset) = Self::scan(&path)?;

        Ok(Self {
            path,
            inner: Mutex::new(LedgerFile {
                file,
                offsets,
                end_offset,
                poisoned: None,
                #[cfg(test)]
                fault: None,
            }),
        })
    }

    /// Walks the whole log, returning record offsets and the end offset.
    fn scan(path: &Path) -> BackendResult<(Vec<u64>, u64)> {
        let mut file = File::open(path).map_err(|e| {
            BackendError::LedgerUnavailable(format!("failed to read ledger: {}", e))
        })?;
        let file_size = file
            .metadata()
            .map_err(|e| BackendError::LedgerUnavailable(format!("ledger metadata: {}", e)))?
            .len();

        let mut offsets = Vec::new();
        let mut offset = 0u64;
        while offset < file_size {
            let record = read_record_at(&mut file, offset, file_size - offset).map_err(|e| {
                BackendError::LedgerRejected(format!(
                    "ledger corrupted at byte_offset {}: {}",
                    offset, e
                ))
            })?;
            let (seq, _) = decode_record(&record).map_err(|reason| {
                BackendError::LedgerRejected(format!(
                    "ledger corrupted at byte_offset {}: {}",
                    offset, reason
                ))
            })?;
            let expected = offsets.len() as u64 + 1;
            if seq != expected {
                return Err(BackendError::LedgerRejected(format!(
                    "non-sequential record: expected {}, got {}",
                    expected, seq
                )));
            }
            offsets.push(offset);
            offset += record.len() as u64;
        }
        Ok((offsets, offset))
    }

    fn inner(&self) -> MutexGuard<'_, LedgerFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the ledger
    pub fn len(&self) -> usize {
        self.inner().offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, data: &[u8]) -> BackendResult<PositionToken> {
        let mut inner = self.inner();
        if let Some(reason) = &inner.poisoned {
            return Err(BackendError::LedgerRejected(reason.clone()));
        }
        let seq = inner.offsets.len() as u64 + 1;
        let record = encode_record(seq, data);

        if let Err(reason) = inner.write_record(&record) {
            if let Err(e) = inner.roll_back() {
                let poisoned = format!(
                    "ledger {} left with partial record {}: {}",
                    self.path.display(),
                    seq,
                    e
                );
                inner.poisoned = Some(poisoned.clone());
                return Err(BackendError::LedgerRejected(poisoned));
            }
            return Err(BackendError::LedgerUnavailable(format!(
                "failed to append record {}: {}",
                seq, reason
            )));
        }

        let offset = inner.end_offset;
        inner.offsets.push(offset);
        inner.end_offset += record.len() as u64;
        Ok(PositionToken::new(seq.to_string()))
    }

    fn read(&self, position: &PositionToken) -> BackendResult<Vec<u8>> {
        let not_found = || BackendError::PositionNotFound(position.to_string());
        let seq: u64 = position.as_str().parse().map_err(|_| not_found())?;
        let offset = {
            let inner = self.inner();
            seq.checked_sub(1)
                .and_then(|i| inner.offsets.get(i as usize).copied())
                .ok_or_else(not_found)?
        };

        let mut file = File::open(&self.path).map_err(|e| {
            BackendError::LedgerUnavailable(format!("failed to open ledger: {}", e))
        })?;
        let file_size = file
            .metadata()
            .map_err(|e| BackendError::LedgerUnavailable(format!("ledger metadata: {}", e)))?
            .len();
        let record = read_record_at(&mut file, offset, file_size.saturating_sub(offset))
            .map_err(|e| {
                BackendError::LedgerRejected(format!("failed to read record {}: {}", seq, e))
            })?;
        let (stored_seq, payload) = decode_record(&record).map_err(|reason| {
            BackendError::LedgerRejected(format!("record {} corrupted: {}", seq, reason))
        })?;
        if stored_seq != seq {
            return Err(BackendError::LedgerRejected(format!(
                "record at position {} carries sequence {}",
                seq, stored_seq
            )));
        }
        Ok(payload)
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn push(&self, data: Vec<u8>) -> BackendResult<PositionToken> {
        self.append(&data)
    }

    async fn fetch(&self, position: &PositionToken) -> BackendResult<Vec<u8>> {
        self.read(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_layout() {
        let record = encode_record(3, b"xyz");
        assert_eq!(record.len(), RECORD_OVERHEAD + 3);
        assert_eq!(&record[..4], &(record.len() as u32).to_le_bytes());
        let (seq, payload) = decode_record(&record).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(payload, b"xyz");
    }

    #[test]
    fn test_decode_rejects_flipped_payload() {
        let mut record = encode_record(1, b"payload");
        record[17] ^= 0xff;
        assert_eq!(decode_record(&record).unwrap_err(), "checksum mismatch");
    }

    #[tokio::test]
    async fn test_push_and_fetch() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        assert!(ledger.is_empty());

        let p1 = ledger.push(b"first".to_vec()).await.unwrap();
        let p2 = ledger.push(b"second".to_vec()).await.unwrap();
        assert_eq!(p1.as_str(), "1");
        assert_eq!(p2.as_str(), "2");
        assert_eq!(ledger.fetch(&p2).await.unwrap(), b"second");
        assert_eq!(ledger.fetch(&p1).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = FileLedger::open(dir.path()).unwrap();
            ledger.push(b"a".to_vec()).await.unwrap();
            ledger.push(b"b".to_vec()).await.unwrap();
        }
        let ledger = FileLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.len(), 2);
        let p3 = ledger.push(b"c".to_vec()).await.unwrap();
        assert_eq!(p3.as_str(), "3");
        assert_eq!(ledger.fetch(&PositionToken::new("1")).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_open_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = {
            let ledger = FileLedger::open(dir.path()).unwrap();
            ledger.push(b"payload".to_vec()).await.unwrap();
            ledger.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        bytes[18] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        let err = FileLedger::open(dir.path()).unwrap_err();
        assert!(matches!(err, BackendError::LedgerRejected(_)));
    }

    #[tokio::test]
    async fn test_open_detects_truncation() {
        let dir = TempDir::new().unwrap();
        let path = {
            let ledger = FileLedger::open(dir.path()).unwrap();
            ledger.push(b"payload".to_vec()).await.unwrap();
            ledger.path().to_path_buf()
        };

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        assert!(FileLedger::open(dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_unknown_position() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        let err = ledger.fetch(&PositionToken::new("1")).await.unwrap_err();
        assert!(matches!(err, BackendError::PositionNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        ledger.push(b"first".to_vec()).await.unwrap();

        for fault in [WriteFault::Partial, WriteFault::Sync] {
            ledger.inner().fault = Some(fault);
            let err = ledger.push(b"lost".to_vec()).await.unwrap_err();
            assert!(matches!(err, BackendError::LedgerUnavailable(_)));
        }

        // the retry takes the same sequence number and reads back intact
        let p2 = ledger.push(b"second".to_vec()).await.unwrap();
        assert_eq!(p2.as_str(), "2");
        assert_eq!(ledger.fetch(&p2).await.unwrap(), b"second");
        drop(ledger);

        let reopened = FileLedger::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.fetch(&PositionToken::new("2")).await.unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_poisoned_ledger_refuses_appends() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        ledger.inner().poisoned = Some("partial record".to_string());

        let err = ledger.push(b"data".to_vec()).await.unwrap_err();
        assert!(matches!(err, BackendError::LedgerRejected(_)));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_oversized_length() {
        let dir = TempDir::new().unwrap();
        let path = {
            let ledger = FileLedger::open(dir.path()).unwrap();
            ledger.push(b"payload".to_vec()).await.unwrap();
            ledger.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        bytes[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let err = FileLedger::open(dir.path()).unwrap_err();
        match err {
            BackendError::LedgerRejected(reason) => assert!(reason.contains("exceeds remaining")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
