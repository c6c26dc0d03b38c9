//! RocksDB wrapper for the referral database
//!
//! This module provides the byte-level key-value adapter the referral
//! store is built on:
//! - One column family per logical column (referrals, parents, children,
//!   ANVs, key ids), so enumeration scans stay bounded to one column
//! - Bloom filters for fast lookups (10 bits/key)
//! - LZ4 compression for storage efficiency
//! - Write-ahead logging with fsync for durability
//! - An in-memory backend for deterministic tests
//!
//! Individual writes are durable; no transaction spans multiple
//! operations. Callers that need multi-key consistency must order their
//! writes accordingly.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MultiThreaded, Options, WriteOptions,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Logical columns of the referral database
///
/// Each column is persisted under its own column family; the one-byte
/// discriminator is the stable on-disk identity of the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// Address -> Referral record
    Referrals,
    /// Child address -> parent address
    Parents,
    /// Parent address -> ordered child address list
    Children,
    /// Address -> ANV record
    Anvs,
    /// Key id -> referral (reserved; unused by this core)
    KeyIds,
}

impl Column {
    /// All columns, in layout order
    pub const ALL: [Column; 5] = [
        Column::Referrals,
        Column::Parents,
        Column::Children,
        Column::Anvs,
        Column::KeyIds,
    ];

    /// One-byte column discriminator used in the persisted layout
    pub fn byte(self) -> u8 {
        match self {
            Column::Referrals => b'r',
            Column::Parents => b'p',
            Column::Children => b'c',
            Column::Anvs => b'a',
            Column::KeyIds => b'k',
        }
    }

    /// Column family name backing this column
    pub fn cf_name(self) -> &'static str {
        match self {
            Column::Referrals => "referrals",
            Column::Parents => "parents",
            Column::Children => "children",
            Column::Anvs => "anvs",
            Column::KeyIds => "key_ids",
        }
    }

    fn index(self) -> usize {
        match self {
            Column::Referrals => 0,
            Column::Parents => 1,
            Column::Children => 2,
            Column::Anvs => 3,
            Column::KeyIds => 4,
        }
    }
}

/// Construction-time database parameters
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Block cache size in megabytes
    pub cache_size_mb: usize,
    /// Keep all data in memory; nothing touches disk
    pub in_memory: bool,
    /// Destroy any existing data before opening
    pub wipe: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            cache_size_mb: 64,
            in_memory: false,
            wipe: false,
        }
    }
}

impl DatabaseOptions {
    /// Options for an in-memory database
    pub fn memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }
}

/// Byte-level column store the referral database runs on
///
/// Implementations provide durable single-operation atomicity and a
/// forward iterator in ascending key order per column.
pub trait KeyValueStore: Send + Sync {
    /// Store a key-value pair in the given column
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<()>;

    /// Fetch a value from the given column
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Remove a key from the given column
    fn delete(&self, column: Column, key: &[u8]) -> Result<()>;

    /// Whether a key exists in the given column
    fn exists(&self, column: Column, key: &[u8]) -> Result<bool>;

    /// All key-value pairs of a column, ascending by key
    fn iter_column(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// RocksDB-backed referral database
pub struct ReferralDatabase {
    /// The underlying RocksDB instance
    db: Arc<DBWithThreadMode<MultiThreaded>>,

    /// Database path
    path: PathBuf,

    /// Write options with fsync enabled
    write_options: WriteOptions,
}

impl ReferralDatabase {
    /// Open or create the referral database
    ///
    /// # Arguments
    /// * `path` - Directory path for the database
    /// * `options` - Cache size and wipe-on-open parameters
    ///
    /// # Errors
    /// Returns error if:
    /// - Directory cannot be created
    /// - Database cannot be opened
    /// - Permission denied
    pub fn open<P: AsRef<Path>>(path: P, options: &DatabaseOptions) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening referral database at: {}", path.display());

        if options.wipe && path.exists() {
            info!("Wiping existing referral database");
            DBWithThreadMode::<MultiThreaded>::destroy(&Options::default(), path)
                .map_err(Self::map_rocksdb_error)?;
        }

        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| {
                Error::Storage(format!("Failed to create database directory: {}", e))
            })?;
        }

        // Block cache shared across all column families
        let cache = Cache::new_lru_cache(options.cache_size_mb * 1024 * 1024);

        let cf_descriptors = Self::create_column_family_descriptors(&cache);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.increase_parallelism(num_cpus::get() as i32);
        db_opts.set_max_open_files(1000);

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            path,
            cf_descriptors,
        )
        .map_err(|e| {
            error!("Failed to open referral database: {}", e);
            Error::Storage(format!("Failed to open database: {}", e))
        })?;

        info!(
            "Referral database opened with {} column families",
            Column::ALL.len()
        );

        // fsync every write; single-operation durability is all callers get
        let mut write_options = WriteOptions::default();
        write_options.set_sync(true);

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            write_options,
        })
    }

    /// Create column family descriptors with shared tuning
    fn create_column_family_descriptors(cache: &Cache) -> Vec<ColumnFamilyDescriptor> {
        Column::ALL
            .iter()
            .map(|column| {
                let mut cf_opts = Options::default();

                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_block_cache(cache);
                block_opts.set_bloom_filter(10.0, false);
                block_opts.set_cache_index_and_filter_blocks(true);
                cf_opts.set_block_based_table_factory(&block_opts);

                cf_opts.set_compression_type(DBCompressionType::Lz4);

                ColumnFamilyDescriptor::new(column.cf_name(), cf_opts)
            })
            .collect()
    }

    /// Get a column family handle
    ///
    /// # Panics
    /// Panics if the column family doesn't exist (should never happen with
    /// our setup)
    fn cf_handle(&self, column: Column) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db
            .cf_handle(column.cf_name())
            .unwrap_or_else(|| panic!("Column family '{}' not found", column.cf_name()))
    }

    /// Get database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map RocksDB errors to our error type with better diagnostics
    fn map_rocksdb_error(err: rocksdb::Error) -> Error {
        let err_str = err.to_string();

        if err_str.contains("No space left on device") {
            Error::Storage("Disk full: No space left on device".to_string())
        } else if err_str.contains("Corruption") {
            Error::Corruption(format!("Data corruption detected: {}", err_str))
        } else {
            Error::Storage(format!("RocksDB error: {}", err_str))
        }
    }
}

impl KeyValueStore for ReferralDatabase {
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf_handle(column);
        self.db
            .put_cf_opt(&cf, key, value, &self.write_options)
            .map_err(|e| {
                error!("Failed to put key in {}: {}", column.cf_name(), e);
                Self::map_rocksdb_error(e)
            })
    }

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(column);
        self.db.get_cf(&cf, key).map_err(|e| {
            error!("Failed to get key from {}: {}", column.cf_name(), e);
            Self::map_rocksdb_error(e)
        })
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<()> {
        let cf = self.cf_handle(column);
        self.db
            .delete_cf_opt(&cf, key, &self.write_options)
            .map_err(|e| {
                error!("Failed to delete key from {}: {}", column.cf_name(), e);
                Self::map_rocksdb_error(e)
            })
    }

    fn exists(&self, column: Column, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(column);
        self.db
            .get_pinned_cf(&cf, key)
            .map(|opt| opt.is_some())
            .map_err(|e| {
                error!(
                    "Failed to check key existence in {}: {}",
                    column.cf_name(),
                    e
                );
                Self::map_rocksdb_error(e)
            })
    }

    fn iter_column(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(column);
        let mut pairs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(Self::map_rocksdb_error)?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }
}

/// In-memory referral database
///
/// Same contract as [`ReferralDatabase`] with nothing touching disk. Used
/// when the store is opened in-memory-only mode, and for deterministic
/// tests.
pub struct MemoryDatabase {
    columns: RwLock<Vec<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryDatabase {
    /// Create an empty in-memory database
    pub fn new() -> Self {
        Self {
            columns: RwLock::new(vec![BTreeMap::new(); Column::ALL.len()]),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryDatabase {
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<()> {
        let mut columns = self.columns.write();
        columns[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let columns = self.columns.read();
        Ok(columns[column.index()].get(key).cloned())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<()> {
        let mut columns = self.columns.write();
        columns[column.index()].remove(key);
        Ok(())
    }

    fn exists(&self, column: Column, key: &[u8]) -> Result<bool> {
        let columns = self.columns.read();
        Ok(columns[column.index()].contains_key(key))
    }

    fn iter_column(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let columns = self.columns.read();
        Ok(columns[column.index()]
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
