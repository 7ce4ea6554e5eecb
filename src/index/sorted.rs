//! Sorted index maintenance.
//!
//! `<kind>__sorted` holds a copy of every live primary record keyed by
//! `"<timestamp>:<sequence>"`, both parts zero padded, so that iterating the
//! tree backwards walks records from newest to oldest. The index is derived
//! state: a rebuild reads the whole primary bucket and swaps the sorted tree
//! contents in one atomic batch.

use crate::codec::{SortKey, TypeRegistry};
use crate::error::ContentResult;
use crate::storage::{Backend, Namespace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Composite key of a sorted index entry.
pub fn sorted_entry_key(timestamp: i64, sequence: usize) -> String {
    format!("{:020}:{:010}", timestamp.max(0), sequence)
}

/// Rebuilds `<kind>__sorted` trees from their primary buckets.
pub struct SortIndexMaintainer {
    backend: Arc<Backend>,
    registry: Arc<TypeRegistry>,

    /// Serializes rebuilds so two swaps never interleave
    rebuild_lock: Mutex<()>,

    /// Number of rebuilds started
    rebuilds: AtomicU64,
}

impl SortIndexMaintainer {
    pub fn new(backend: Arc<Backend>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            backend,
            registry,
            rebuild_lock: Mutex::new(()),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Number of rebuilds started since creation.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    /// Full rebuild of the sorted index of `namespace`. Returns the number of
    /// indexed records.
    ///
    /// Any record that fails to decode aborts the rebuild and leaves the
    /// previous index untouched.
    pub fn rebuild(&self, namespace: &Namespace) -> ContentResult<usize> {
        if !namespace.is_primary() {
            debug!(namespace = %namespace, "Skipping sort for non-primary namespace");
            return Ok(0);
        }

        let descriptor = self.registry.get(namespace.kind())?;
        let _guard = self.rebuild_lock.lock();
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let mut entries: Vec<(SortKey, sled::IVec)> = Vec::new();
        if let Some(primary) = self.backend.bucket(&namespace.bucket())? {
            for item in primary.iter() {
                let (_, raw) = item?;
                let record = descriptor.decode_bytes(&raw).map_err(|e| {
                    warn!(namespace = %namespace, "Error decoding record while sorting: {}", e);
                    e
                })?;
                entries.push((descriptor.sort_key(&record), raw));
            }
        }

        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let sorted = self.backend.bucket_or_create(&namespace.sorted_bucket())?;
        let mut batch = sled::Batch::default();
        for key in sorted.iter().keys() {
            batch.remove(key?);
        }

        let count = entries.len();
        for (i, (key, raw)) in entries.into_iter().enumerate() {
            batch.insert(sorted_entry_key(key.timestamp, count - 1 - i).as_bytes(), raw);
        }
        sorted.apply_batch(batch)?;

        info!(
            namespace = %namespace,
            records = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sorted index rebuilt"
        );
        Ok(count)
    }
}
