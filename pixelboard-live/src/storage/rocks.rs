//! RocksDB-backed pixel store.
//!
//! Column families:
//! - `pixels`: committed pixels, keyed by `x:u32 BE ‖ y:u32 BE`, value color index (u32 BE)
//! - `snapshots`: LZ4-compressed bincode [`SnapshotRecord`], keyed by snapshot id (u64 BE)
//! - `snapshot_meta`: bincode [`SnapshotInfo`], same key as `snapshots`
//!
//! Only pixels that were written at least once are stored. Cells that were
//! never touched stay at color index 0 and cost nothing on disk.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use thiserror::Error;

use crate::board::PixelChange;

const CF_PIXELS: &str = "pixels";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SNAPSHOT_META: &str = "snapshot_meta";

const COLUMN_FAMILIES: &[&str] = &[CF_PIXELS, CF_SNAPSHOTS, CF_SNAPSHOT_META];

/// Store configuration.
///
/// `path = None` disables persistence entirely (volatile mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: Option<PathBuf>,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Snapshots retained before the oldest is deleted (0 = keep all)
    pub max_snapshots: usize,
    /// Seconds between automatic snapshots
    pub snapshot_interval_secs: u64,
    /// Wipe the pixel table on open
    pub reset_board: bool,
    /// Wipe all snapshots on open
    pub reset_snapshots: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("pixelboard_data")),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            max_snapshots: 10,
            snapshot_interval_secs: 300,
            reset_board: false,
            reset_snapshots: false,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, explicit directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            max_snapshots: 3,
            ..Self::default()
        }
    }

    /// Config with persistence disabled.
    pub fn volatile() -> Self {
        Self {
            path: None,
            ..Self::default()
        }
    }
}

/// Summary of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: u64,
    pub label: String,
    /// Seconds since epoch
    pub created_at: u64,
    pub pixel_count: u64,
    pub compressed_size: u64,
}

/// Full content of a snapshot: a copy of the pixel table at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: u64,
    pub label: String,
    pub created_at: u64,
    pub pixels: Vec<PixelChange>,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or opened
    #[error("Persistence unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(u64),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed store for committed pixels and board snapshots.
pub struct PixelStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    path: PathBuf,
    /// Next snapshot id
    next_snapshot: AtomicU64,
}

impl PixelStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist and
    /// applies the configured reset flags.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| StoreError::Unavailable("no storage path configured".into()))?;

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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;

        let next_snapshot = Self::recover_snapshot_id(&db);

        let store = Self {
            db,
            config,
            path,
            next_snapshot: AtomicU64::new(next_snapshot),
        };

        if store.config.reset_board || store.config.reset_snapshots {
            store.reset(store.config.reset_board, store.config.reset_snapshots)?;
        }

        Ok(store)
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
            CF_PIXELS => {
                // Tiny fixed-size values, one upsert per mutation
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_SNAPSHOTS => {
                // Already LZ4-compressed by us
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_SNAPSHOT_META => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Highest snapshot id on disk + 1.
    fn recover_snapshot_id(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_SNAPSHOT_META) {
            Some(cf) => cf,
            None => return 1,
        };

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                u64::from_be_bytes(buf) + 1
            }
            _ => 1,
        }
    }

    // ─── Pixels ───────────────────────────────────────────────────────

    /// Upsert a single committed pixel.
    pub fn put_pixel(&self, change: &PixelChange) -> Result<(), StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(
            cf,
            Self::pixel_key(change.x, change.y),
            change.color_index.to_be_bytes(),
            &write_opts,
        )?;
        Ok(())
    }

    /// Load every persisted pixel, ordered by key (x, then y).
    pub fn load_pixels(&self) -> Result<Vec<PixelChange>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut pixels = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match Self::decode_pixel(&key, &value) {
                Some(pixel) => pixels.push(pixel),
                None => log::warn!("Skipping malformed pixel record ({} byte key)", key.len()),
            }
        }

        Ok(pixels)
    }

    /// Number of persisted pixels.
    pub fn pixel_count(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Copy the current pixel table into a new labelled snapshot.
    ///
    /// Enforces `max_snapshots` by deleting the oldest snapshots.
    pub fn create_snapshot(&self, label: &str) -> Result<SnapshotInfo, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_SNAPSHOT_META)?;

        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
        let record = SnapshotRecord {
            id,
            label: label.to_string(),
            created_at: unix_now(),
            pixels: self.load_pixels()?,
        };

        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let info = SnapshotInfo {
            id,
            label: record.label,
            created_at: record.created_at,
            pixel_count: record.pixels.len() as u64,
            compressed_size: compressed.len() as u64,
        };
        let info_bytes = bincode::serde::encode_to_vec(&info, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let key = id.to_be_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, key, &compressed);
        batch.put_cf(cf_meta, key, &info_bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.enforce_retention()?;

        Ok(info)
    }

    /// All snapshot summaries, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        let cf = self.cf(CF_SNAPSHOT_META)?;
        let mut infos = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (info, _) = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            infos.push(info);
        }

        Ok(infos)
    }

    /// Load and decompress a snapshot by id.
    pub fn load_snapshot(&self, id: u64) -> Result<SnapshotRecord, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = self
            .db
            .get_cf(cf, id.to_be_bytes())?
            .ok_or(StoreError::SnapshotNotFound(id))?;

        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }

    fn enforce_retention(&self) -> Result<u64, StoreError> {
        let max = self.config.max_snapshots;
        if max == 0 {
            return Ok(0);
        }

        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_SNAPSHOT_META)?;

        let keys: Vec<Box<[u8]>> = self
            .db
            .iterator_cf(cf_meta, IteratorMode::Start)
            .map(|item| item.map(|(key, _)| key))
            .collect::<Result<_, _>>()?;

        if keys.len() <= max {
            return Ok(0);
        }

        let excess = keys.len() - max;
        let mut batch = WriteBatch::default();
        for key in &keys[..excess] {
            batch.delete_cf(cf_snap, key);
            batch.delete_cf(cf_meta, key);
        }
        self.db.write(batch)?;

        log::debug!("Deleted {excess} old snapshot(s), keeping {max}");
        Ok(excess as u64)
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Wipe the pixel table and/or all snapshots.
    pub fn reset(&self, reset_board: bool, reset_snapshots: bool) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        let mut families = Vec::new();
        if reset_board {
            families.push(CF_PIXELS);
        }
        if reset_snapshots {
            families.extend([CF_SNAPSHOTS, CF_SNAPSHOT_META]);
        }

        for name in &families {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }

        if families.is_empty() {
            return Ok(());
        }

        self.db.write(batch)?;
        if reset_snapshots {
            self.next_snapshot.store(1, Ordering::SeqCst);
        }
        log::warn!(
            "Pixel store reset at {} (board: {reset_board}, snapshots: {reset_snapshots})",
            self.path.display()
        );
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn pixel_key(x: u32, y: u32) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&x.to_be_bytes());
        key[4..].copy_from_slice(&y.to_be_bytes());
        key
    }

    fn decode_pixel(key: &[u8], value: &[u8]) -> Option<PixelChange> {
        let key: [u8; 8] = key.try_into().ok()?;
        let value: [u8; 4] = value.try_into().ok()?;
        let mut x = [0u8; 4];
        let mut y = [0u8; 4];
        x.copy_from_slice(&key[..4]);
        y.copy_from_slice(&key[4..]);
        Some(PixelChange {
            x: u32::from_be_bytes(x),
            y: u32::from_be_bytes(y),
            color_index: u32::from_be_bytes(value),
        })
    }
}

fn unix_now() -> u64 {
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
