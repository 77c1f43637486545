//! RocksDB-backed `SnapshotStore`.
//!
//! Column families:
//! - `documents`: latest snapshot per document (LZ4 compressed)
//! - `updates`: update log since that snapshot, keyed by `doc_id:seq`
//! - `metadata`: per-document bookkeeping (bincode), including the tombstone flag
//!
//! Snapshot writes and log truncation go into one `WriteBatch`, so a crash
//! never leaves a snapshot next to the log entries it already folded in.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{SnapshotStore, StoreError, StoredDocument};
use crate::protocol::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored alongside each document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Sequence number the next appended update gets
    pub next_update_seq: u64,
    /// Updates in the log since the last snapshot
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    pub tombstoned: bool,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            next_update_seq: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            tombstoned: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                // Point lookups by document id
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small appends, prefix-scanned by doc id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Load document metadata, if the document was ever written.
    pub fn metadata(&self, doc_id: DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, doc_id.as_bytes())?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn live_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        match self.metadata(doc_id)? {
            Some(meta) if meta.tombstoned => Err(StoreError::Tombstoned(doc_id)),
            Some(meta) => Ok(meta),
            None => Ok(DocumentMetadata::new(doc_id)),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Queue deletion of every update-log entry for `doc_id`.
    fn clear_updates(&self, doc_id: DocumentId, batch: &mut WriteBatch) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(doc_id, 0);
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        Ok(count)
    }

    fn load_updates(&self, doc_id: DocumentId) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(doc_id, 0);
        let mut updates = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            updates.push(decompress(&value)?);
        }
        Ok(updates)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl SnapshotStore for DocumentStore {
    fn load(&self, doc_id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let Some(meta) = self.metadata(doc_id)? else {
            return Ok(None);
        };
        if meta.tombstoned {
            return Err(StoreError::Tombstoned(doc_id));
        }
        let snapshot = self
            .db
            .get_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes())?
            .map(|compressed| decompress(&compressed))
            .transpose()?;
        Ok(Some(StoredDocument {
            snapshot,
            updates: self.load_updates(doc_id)?,
        }))
    }

    fn put_snapshot(&self, doc_id: DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut meta = self.live_metadata(doc_id)?;
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut batch = WriteBatch::default();
        let removed = self.clear_updates(doc_id, &mut batch)?;
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes(), &compressed);

        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.update_count = 0;
        meta.updated_at = now_secs();
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Snapshot for {doc_id}: {} bytes ({} compressed), {removed} updates folded",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn append_update(&self, doc_id: DocumentId, update: &[u8]) -> Result<u64, StoreError> {
        let mut meta = self.live_metadata(doc_id)?;
        let seq = meta.next_update_seq;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_UPDATES)?, update_key(doc_id, seq), lz4_flex::compress_prepend_size(update));

        meta.next_update_seq += 1;
        meta.update_count += 1;
        meta.updated_at = now_secs();
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;
        Ok(seq)
    }

    fn tombstone(&self, doc_id: DocumentId) -> Result<(), StoreError> {
        let mut meta = self.metadata(doc_id)?.unwrap_or_else(|| DocumentMetadata::new(doc_id));

        let mut batch = WriteBatch::default();
        self.clear_updates(doc_id, &mut batch)?;
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes());

        meta.tombstoned = true;
        meta.update_count = 0;
        meta.snapshot_size = 0;
        meta.compressed_size = 0;
        meta.updated_at = now_secs();
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn is_tombstoned(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
        Ok(self.metadata(doc_id)?.is_some_and(|m| m.tombstoned))
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let Ok(bytes) = <[u8; 16]>::try_from(&key[..]) else {
                continue;
            };
            if !DocumentMetadata::decode(&value)?.tombstoned {
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(doc_ids)
    }
}

/// Update key: doc_id (16 bytes) + sequence (8 bytes big-endian).
fn update_key(doc_id: DocumentId, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_unknown_document_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.load(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_snapshot_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = Uuid::new_v4();

        assert_eq!(store.append_update(doc, b"one").unwrap(), 0);
        assert_eq!(store.append_update(doc, b"two").unwrap(), 1);
        let loaded = store.load(doc).unwrap().unwrap();
        assert_eq!(loaded.snapshot, None);
        assert_eq!(loaded.updates, vec![b"one".to_vec(), b"two".to_vec()]);

        store.put_snapshot(doc, b"folded state").unwrap();
        assert_eq!(store.append_update(doc, b"three").unwrap(), 2);

        let loaded = store.load(doc).unwrap().unwrap();
        assert_eq!(loaded.snapshot.as_deref(), Some(&b"folded state"[..]));
        assert_eq!(loaded.updates, vec![b"three".to_vec()]);
        assert_eq!(store.metadata(doc).unwrap().unwrap().update_count, 1);
    }

    #[test]
    fn test_documents_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append_update(a, b"a1").unwrap();
        store.append_update(b, b"b1").unwrap();
        store.put_snapshot(a, b"a-snap").unwrap();

        assert_eq!(store.load(b).unwrap().unwrap().updates, vec![b"b1".to_vec()]);
        let mut listed = store.list_documents().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = Uuid::new_v4();
        store.put_snapshot(doc, b"content").unwrap();
        store.append_update(doc, b"more").unwrap();

        store.tombstone(doc).unwrap();
        assert_eq!(store.load(doc), Err(StoreError::Tombstoned(doc)));
        assert!(store.is_tombstoned(doc).unwrap());
        assert!(store.list_documents().unwrap().is_empty());
        assert_eq!(store.put_snapshot(doc, b"again"), Err(StoreError::Tombstoned(doc)));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        let snapshot = vec![7u8; 100_000];
        {
            let store = open(&dir);
            store.put_snapshot(doc, &snapshot).unwrap();
            store.append_update(doc, b"tail").unwrap();
            let meta = store.metadata(doc).unwrap().unwrap();
            assert!(meta.compressed_size < meta.snapshot_size / 10);
        }

        let store = open(&dir);
        let loaded = store.load(doc).unwrap().unwrap();
        assert_eq!(loaded.snapshot, Some(snapshot));
        assert_eq!(loaded.updates, vec![b"tail".to_vec()]);
        assert_eq!(store.append_update(doc, b"next").unwrap(), 1);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("quire_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
