//! Sled-backed persistent storage backend.
//!
//! Every bucket the engine talks about is a sled tree. Besides the per-namespace
//! trees (`Post`, `Post__pending`, `Post__sorted`, `Post::tags`) the backend
//! owns two internal trees that are opened eagerly:
//! - `__content_index`: slug -> `namespace:id`
//! - `__sequences`: bucket name -> last allocated id (big-endian u64)
//!
//! Tree handles are cached so that hot paths do not go through `open_tree`
//! repeatedly. Reads never create a tree: asking for a bucket that was never
//! written yields `None`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the shared slug index tree.
pub const CONTENT_INDEX_TREE: &str = "__content_index";

/// Name of the per-bucket id sequence tree.
pub const SEQUENCE_TREE: &str = "__sequences";

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt sequence value for bucket {0}")]
    CorruptSequence(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages to disk, in milliseconds.
    pub flush_interval_ms: u64,

    /// Use a throwaway database that is removed on drop.
    pub temporary: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 64,
            flush_interval_ms: 1000,
            temporary: false,
        }
    }
}

/// The persistent storage backend using sled.
pub struct Backend {
    db: sled::Db,

    /// Slug -> "namespace:id"
    content_index: sled::Tree,

    /// Bucket name -> last allocated id
    sequences: sled::Tree,

    /// Cache of opened bucket trees, keyed by bucket name
    buckets: RwLock<HashMap<String, sled::Tree>>,
}

impl Backend {
    /// Opens (or creates) the database described by `config`.
    pub fn new(config: BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        if !config.temporary {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .temporary(config.temporary)
            .open()
            .map_err(|e| BackendError::Config(format!("Failed to open sled database: {}", e)))?;

        let content_index = db.open_tree(CONTENT_INDEX_TREE)?;
        let sequences = db.open_tree(SEQUENCE_TREE)?;

        info!(
            "Storage backend initialized with cache_size={}MB, flush_interval={}ms",
            config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Arc::new(Self {
            db,
            content_index,
            sequences,
            buckets: RwLock::new(HashMap::new()),
        }))
    }

    /// The shared slug index tree.
    pub fn content_index(&self) -> &sled::Tree {
        &self.content_index
    }

    /// The id sequence tree.
    pub fn sequences(&self) -> &sled::Tree {
        &self.sequences
    }

    /// Returns the bucket if it has ever been created.
    pub fn bucket(&self, name: &str) -> BackendResult<Option<sled::Tree>> {
        if let Some(tree) = self.buckets.read().get(name) {
            return Ok(Some(tree.clone()));
        }

        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|n| &n[..] == name.as_bytes());
        if !exists {
            return Ok(None);
        }

        self.bucket_or_create(name).map(Some)
    }

    /// Returns the bucket, creating it when missing.
    pub fn bucket_or_create(&self, name: &str) -> BackendResult<sled::Tree> {
        if let Some(tree) = self.buckets.read().get(name) {
            return Ok(tree.clone());
        }

        let mut buckets = self.buckets.write();
        if let Some(tree) = buckets.get(name) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(name)?;
        buckets.insert(name.to_string(), tree.clone());
        debug!(bucket = name, "Opened bucket");
        Ok(tree)
    }

    /// Names of all user buckets (internal trees excluded).
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|n| String::from_utf8(n.to_vec()).ok())
            .filter(|n| !n.starts_with("__"))
            .collect();
        names.sort();
        names
    }

    /// Last id allocated for a bucket, 0 when none was.
    pub fn last_sequence(&self, bucket: &str) -> BackendResult<u64> {
        match self.sequences.get(bucket.as_bytes())? {
            Some(raw) => decode_sequence(bucket, &raw),
            None => Ok(0),
        }
    }

    /// Returns the approximate total size of the database in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Decodes a stored sequence value.
pub fn decode_sequence(bucket: &str, raw: &[u8]) -> BackendResult<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| BackendError::CorruptSequence(bucket.to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Record key for an id. Big-endian keeps cursor order equal to id order.
pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Inverse of [`id_key`].
pub fn key_id(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
