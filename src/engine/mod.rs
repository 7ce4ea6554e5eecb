//! Engine wiring.
//!
//! [`ContentEngine::open`] brings up the subsystems in dependency order:
//! - sled backend
//! - sorted index maintainer and its refresh worker
//! - search dispatcher
//! - repository and query engine
//!
//! It must be called from inside a tokio runtime; background work is spawned on
//! the runtime that was current at open time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::TypeRegistry;
use crate::error::{ContentError, ContentResult};
use crate::index::{RefreshScheduler, SlugIndex, SortIndexMaintainer};
use crate::query::QueryEngine;
use crate::repository::ContentRepository;
use crate::search::{SearchDispatcher, SearchNotifier};
use crate::storage::{Backend, BackendConfig};

/// Configuration for a content engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Path to the data directory.
    pub data_dir: PathBuf,

    /// Backend page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Backend flush interval in milliseconds.
    pub flush_interval_ms: u64,

    /// Minimum interval between two sorted index rebuilds of one namespace.
    pub debounce_window: Duration,

    /// Throwaway store, removed when the engine is dropped.
    pub temporary: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 64,
            flush_interval_ms: 1000,
            debounce_window: Duration::from_secs(2),
            temporary: false,
        }
    }
}

impl EngineConfig {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            data_dir: self.data_dir.clone(),
            cache_size_mb: self.cache_size_mb,
            flush_interval_ms: self.flush_interval_ms,
            temporary: self.temporary,
        }
    }
}

/// A running content engine.
pub struct ContentEngine {
    config: EngineConfig,
    backend: Arc<Backend>,
    registry: Arc<TypeRegistry>,
    maintainer: Arc<SortIndexMaintainer>,
    repository: ContentRepository,
    query: QueryEngine,
    slugs: SlugIndex,
    background_tasks: Vec<JoinHandle<()>>,
}

impl ContentEngine {
    /// Opens the store and starts the background refresh worker.
    pub fn open(
        config: EngineConfig,
        registry: TypeRegistry,
        notifier: Arc<dyn SearchNotifier>,
    ) -> ContentResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ContentError::Internal(format!("content engine needs a tokio runtime: {}", e)))?;

        info!(
            data_dir = %config.data_dir.display(),
            debounce_ms = config.debounce_window.as_millis() as u64,
            "Opening content engine"
        );

        let backend = Backend::new(config.backend_config())?;
        let registry = Arc::new(registry);
        debug!(kinds = ?registry.kinds(), "Registered namespace types");

        let maintainer = Arc::new(SortIndexMaintainer::new(backend.clone(), registry.clone()));
        let (scheduler, refresh_handle) =
            RefreshScheduler::spawn(maintainer.clone(), config.debounce_window, &runtime);
        let search = SearchDispatcher::new(notifier, runtime);

        let repository = ContentRepository::new(backend.clone(), registry.clone(), scheduler, search);
        let query = QueryEngine::new(backend.clone());
        let slugs = SlugIndex::new(backend.clone());

        info!(buckets = backend.bucket_names().len(), "Content engine ready");

        Ok(Self {
            config,
            backend,
            registry,
            maintainer,
            repository,
            query,
            slugs,
            background_tasks: vec![refresh_handle],
        })
    }

    pub fn repository(&self) -> &ContentRepository {
        &self.repository
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    pub fn slugs(&self) -> &SlugIndex {
        &self.slugs
    }

    pub fn maintainer(&self) -> Arc<SortIndexMaintainer> {
        self.maintainer.clone()
    }

    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    pub fn registry(&self) -> Arc<TypeRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stops the refresh worker and flushes the store. Deferred rebuilds that
    /// had not fired yet are dropped; the sorted index can always be rebuilt.
    pub fn shutdown(&mut self) -> ContentResult<()> {
        for handle in self.background_tasks.drain(..) {
            handle.abort();
        }
        self.backend.flush()?;
        info!("Content engine shut down");
        Ok(())
    }
}
