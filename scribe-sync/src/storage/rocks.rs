//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — full CRDT snapshots (LZ4 compressed), keyed by document id
//! - `metadata`  — bincode [`DocumentMetadata`]: delta mirror (JSON) + sizes + timestamps
//!
//! Snapshot and metadata are written in one atomic batch, so a reader never
//! sees a snapshot without its mirror. RocksDB calls are blocking and run on
//! the tokio blocking pool.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{unix_now, DocumentStore, PersistedRecord, StoreError};
use crate::config::StorageConfig;
use crate::doc::{Delta, DocumentId};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

impl From<&StorageConfig> for StoreConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            path: config.path.clone(),
            sync_writes: config.sync_writes,
            ..Self::default()
        }
    }
}

/// Per-document metadata stored next to the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    /// Delta mirror as JSON (attributes are free-form, so not bincode-native).
    pub delta_json: String,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }

    pub fn delta(&self) -> Result<Delta, StoreError> {
        serde_json::from_str(&self.delta_json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

type Db = DBWithThreadMode<SingleThreaded>;

/// Durable store with LZ4 snapshots, bloom filters and a block cache.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<Db>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (creating if missing) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Already LZ4-compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Records ──────────────────────────────────────────────────────

    /// Write snapshot and mirror atomically.
    pub fn save_record(
        &self,
        id: &DocumentId,
        snapshot: &[u8],
        delta: &Delta,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let now = unix_now();
        let created_at = self
            .load_metadata(id)?
            .map_or(now, |existing| existing.created_at);
        let meta = DocumentMetadata {
            id: id.to_string(),
            delta_json: serde_json::to_string(delta)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            snapshot_size: snapshot.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at,
            updated_at: now,
        };

        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Read snapshot and mirror; `None` when the document was never saved.
    pub fn load_record(&self, id: &DocumentId) -> Result<Option<PersistedRecord>, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(&cf_docs, id.as_str().as_bytes())? else {
            return Ok(None);
        };
        let snapshot = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;

        let (delta, updated_at) = match self.load_metadata(id)? {
            Some(meta) => (meta.delta()?, meta.updated_at),
            None => (Vec::new(), 0),
        };

        Ok(Some(PersistedRecord {
            id: id.clone(),
            snapshot,
            delta,
            updated_at,
        }))
    }

    pub fn load_metadata(&self, id: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, id.as_str().as_bytes())?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    /// Ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(DocumentId::new(id));
        }
        Ok(ids)
    }

    pub fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = id.as_str().as_bytes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, key);
        batch.delete_cf(&cf_meta, key);
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<PersistedRecord>, StoreError> {
        let store = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || store.load_record(&id)).await?
    }

    async fn save(
        &self,
        id: &DocumentId,
        snapshot: Vec<u8>,
        delta: Delta,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || store.save_record(&id, &snapshot, &delta).map(|_| ()))
            .await?
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
