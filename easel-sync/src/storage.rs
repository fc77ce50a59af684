//! Durable storage: snapshot + diff-log pairs per document.
//!
//! ```text
//! <root>/<doc_id>/snapshot.bin   lz4(bincode(SnapshotFile))
//! <root>/<doc_id>/log.bin        [len u32][LogEntry]* append-only
//! ```
//!
//! A document is reconstructable by loading the latest snapshot and
//! replaying the log entries above its epoch. Every log entry carries an
//! FNV-fold checksum; replay stops at the first corrupt entry rather than
//! feeding damaged diffs into a store. Compaction writes a fresh snapshot
//! at the current epoch and truncates the log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use uuid::Uuid;

use easel_store::SchemaFingerprint;

use crate::protocol::{WireDiff, WireRecord};

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per document.
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Storage errors.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Serialization(String),
    /// Snapshot payload failed decompression or decoding.
    CorruptSnapshot(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage I/O error: {e}"),
            StorageError::Serialization(e) => write!(f, "storage serialization error: {e}"),
            StorageError::CorruptSnapshot(e) => write!(f, "corrupt snapshot: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// On-disk snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub epoch: u64,
    pub schema: SchemaFingerprint,
    pub records: Vec<WireRecord>,
}

/// One log record: a serialized diff plus integrity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    /// `to_epoch` of the contained diff.
    seq: u64,
    checksum: u32,
    /// lz4-compressed bincode of a [`WireDiff`].
    payload: Vec<u8>,
}

impl LogEntry {
    fn new(seq: u64, payload: Vec<u8>) -> Self {
        let checksum = fnv_fold(seq, &payload);
        Self {
            seq,
            checksum,
            payload,
        }
    }

    fn verify(&self) -> bool {
        self.checksum == fnv_fold(self.seq, &self.payload)
    }
}

/// FNV-1a fold over the sequence number and payload.
fn fnv_fold(seq: u64, payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= seq as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    hash ^= (seq >> 32) as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    for chunk in payload.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Per-document snapshot + diff-log persistence.
pub struct DocumentStorage {
    config: StorageConfig,
}

impl DocumentStorage {
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.root)?;
        Ok(Self { config })
    }

    fn doc_dir(&self, doc: Uuid) -> PathBuf {
        self.config.root.join(doc.to_string())
    }

    fn snapshot_path(&self, doc: Uuid) -> PathBuf {
        self.doc_dir(doc).join("snapshot.bin")
    }

    fn log_path(&self, doc: Uuid) -> PathBuf {
        self.doc_dir(doc).join("log.bin")
    }

    /// Write a snapshot at the given epoch and truncate the log: the
    /// snapshot supersedes all logged history.
    pub fn save_snapshot(
        &self,
        doc: Uuid,
        epoch: u64,
        schema: SchemaFingerprint,
        records: Vec<WireRecord>,
    ) -> Result<(), StorageError> {
        fs::create_dir_all(self.doc_dir(doc))?;
        let snapshot = SnapshotFile {
            epoch,
            schema,
            records,
        };
        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        fs::write(self.snapshot_path(doc), compressed)?;
        // The log restarts above the snapshot epoch.
        let _ = fs::remove_file(self.log_path(doc));
        log::info!(
            "persisted snapshot for {doc} at epoch {epoch} ({} records)",
            snapshot.records.len()
        );
        Ok(())
    }

    pub fn load_snapshot(&self, doc: Uuid) -> Result<Option<SnapshotFile>, StorageError> {
        let path = self.snapshot_path(doc);
        if !path.exists() {
            return Ok(None);
        }
        let compressed = fs::read(path)?;
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StorageError::CorruptSnapshot(e.to_string()))?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| StorageError::CorruptSnapshot(e.to_string()))?;
        Ok(Some(snapshot))
    }

    /// Append one committed diff to the document's log.
    pub fn append_diff(&self, doc: Uuid, diff: &WireDiff) -> Result<(), StorageError> {
        fs::create_dir_all(self.doc_dir(doc))?;
        let encoded = bincode::serde::encode_to_vec(diff, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let entry = LogEntry::new(diff.to_epoch, lz4_flex::compress_prepend_size(&encoded));
        let entry_bytes = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(doc))?;
        file.write_all(&(entry_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&entry_bytes)?;
        Ok(())
    }

    /// Logged diffs above `after_epoch`, in order. Replay stops with a
    /// warning at the first corrupt or truncated entry.
    pub fn load_diffs(&self, doc: Uuid, after_epoch: u64) -> Result<Vec<WireDiff>, StorageError> {
        let path = self.log_path(doc);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let mut diffs = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= bytes.len() {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            offset += 4;
            if offset + len > bytes.len() {
                log::warn!("truncated log entry for {doc}; stopping replay");
                break;
            }
            let entry: LogEntry = match bincode::serde::decode_from_slice(
                &bytes[offset..offset + len],
                bincode::config::standard(),
            ) {
                Ok((entry, _)) => entry,
                Err(e) => {
                    log::warn!("undecodable log entry for {doc}: {e}; stopping replay");
                    break;
                }
            };
            offset += len;
            if !entry.verify() {
                log::warn!(
                    "checksum mismatch in log of {doc} at seq {}; stopping replay",
                    entry.seq
                );
                break;
            }
            let encoded = match lz4_flex::decompress_size_prepended(&entry.payload) {
                Ok(encoded) => encoded,
                Err(e) => {
                    log::warn!("corrupt log payload for {doc}: {e}; stopping replay");
                    break;
                }
            };
            let diff: WireDiff = match bincode::serde::decode_from_slice(
                &encoded,
                bincode::config::standard(),
            ) {
                Ok((diff, _)) => diff,
                Err(e) => {
                    log::warn!("corrupt diff in log of {doc}: {e}; stopping replay");
                    break;
                }
            };
            if diff.from_epoch >= after_epoch {
                diffs.push(diff);
            }
        }
        Ok(diffs)
    }

    /// Snapshot plus log tail for a document, if any state was persisted.
    pub fn load_document(
        &self,
        doc: Uuid,
    ) -> Result<Option<(SnapshotFile, Vec<WireDiff>)>, StorageError> {
        let snapshot = match self.load_snapshot(doc)? {
            Some(snapshot) => snapshot,
            None => return Ok(None),
        };
        let diffs = self.load_diffs(doc, snapshot.epoch)?;
        Ok(Some((snapshot, diffs)))
    }

    /// All documents with persisted state.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut docs = Vec::new();
        for entry in fs::read_dir(&self.config.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = Uuid::parse_str(name) {
                    docs.push(id);
                }
            }
        }
        docs.sort();
        Ok(docs)
    }

    /// Number of entries currently in a document's log.
    pub fn log_len(&self, doc: Uuid) -> Result<usize, StorageError> {
        Ok(self.load_diffs(doc, 0)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_store::{PageProps, Record, RecordId, RecordProps, RecordType, StoreSchema};

    fn page_wire() -> WireRecord {
        let record = Record::new(
            RecordId::new(RecordType::Page, "p1"),
            2,
            RecordProps::Page(PageProps {
                name: "Page 1".into(),
                index: 0,
            }),
        );
        WireRecord::from_record(&record).unwrap()
    }

    fn wire_diff(from: u64) -> WireDiff {
        WireDiff {
            from_epoch: from,
            to_epoch: from + 1,
            added: vec![page_wire()],
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    fn open_temp() -> (tempfile::TempDir, DocumentStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DocumentStorage::open(StorageConfig::new(dir.path().join("docs"))).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (_dir, storage) = open_temp();
        let doc = Uuid::from_u128(1);
        let schema = StoreSchema::canvas().fingerprint();

        storage
            .save_snapshot(doc, 7, schema.clone(), vec![page_wire()])
            .unwrap();
        let loaded = storage.load_snapshot(doc).unwrap().unwrap();
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.schema, schema);
        assert_eq!(loaded.records, vec![page_wire()]);
    }

    #[test]
    fn test_missing_document_is_none() {
        let (_dir, storage) = open_temp();
        assert!(storage.load_document(Uuid::from_u128(9)).unwrap().is_none());
    }

    #[test]
    fn test_log_append_and_replay() {
        let (_dir, storage) = open_temp();
        let doc = Uuid::from_u128(1);
        storage
            .save_snapshot(doc, 0, StoreSchema::canvas().fingerprint(), Vec::new())
            .unwrap();
        storage.append_diff(doc, &wire_diff(0)).unwrap();
        storage.append_diff(doc, &wire_diff(1)).unwrap();
        storage.append_diff(doc, &wire_diff(2)).unwrap();

        let (snapshot, diffs) = storage.load_document(doc).unwrap().unwrap();
        assert_eq!(snapshot.epoch, 0);
        assert_eq!(diffs.len(), 3);
        assert_eq!(diffs[0].from_epoch, 0);
        assert_eq!(diffs[2].to_epoch, 3);
    }

    #[test]
    fn test_snapshot_truncates_log() {
        let (_dir, storage) = open_temp();
        let doc = Uuid::from_u128(1);
        storage
            .save_snapshot(doc, 0, StoreSchema::canvas().fingerprint(), Vec::new())
            .unwrap();
        storage.append_diff(doc, &wire_diff(0)).unwrap();
        storage.append_diff(doc, &wire_diff(1)).unwrap();

        storage
            .save_snapshot(doc, 2, StoreSchema::canvas().fingerprint(), vec![page_wire()])
            .unwrap();
        let (snapshot, diffs) = storage.load_document(doc).unwrap().unwrap();
        assert_eq!(snapshot.epoch, 2);
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_corrupt_entry_stops_replay() {
        let (_dir, storage) = open_temp();
        let doc = Uuid::from_u128(1);
        storage.append_diff(doc, &wire_diff(0)).unwrap();
        storage.append_diff(doc, &wire_diff(1)).unwrap();

        // Flip a byte in the middle of the second entry.
        let path = storage.log_path(doc);
        let mut bytes = fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 5] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let diffs = storage.load_diffs(doc, 0).unwrap();
        assert_eq!(diffs.len(), 1);
    }

    #[test]
    fn test_list_documents() {
        let (_dir, storage) = open_temp();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        storage.append_diff(a, &wire_diff(0)).unwrap();
        storage
            .save_snapshot(b, 0, StoreSchema::canvas().fingerprint(), Vec::new())
            .unwrap();

        let docs = storage.list_documents().unwrap();
        assert_eq!(docs, vec![a, b]);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let entry = LogEntry::new(5, vec![1, 2, 3, 4]);
        assert!(entry.verify());
        let mut tampered = entry.clone();
        tampered.payload[0] ^= 0xFF;
        assert!(!tampered.verify());
    }
}
