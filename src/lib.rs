//! # rucms: content storage and secondary indexing on sled
//!
//! rucms stores typed content records in namespaced sled trees and keeps the
//! derived structures around them up to date:
//!
//! - **Buckets**: one tree per namespace variant (`Post`, `Post__pending`)
//!   with ids allocated from a persisted per-bucket sequence
//! - **Slug index**: unique human-readable slugs resolving to `namespace:id`,
//!   claimed in the same transaction as the record
//! - **Sorted index**: a debounced, fully rebuilt `Post__sorted` tree ordering
//!   records newest first
//! - **Queries**: cursor pagination, field filters, substring, regex and time
//!   range scans
//! - **Search notification**: fire-and-forget updates to an external indexer
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use rucms::{ContentEngine, Consistency, EngineConfig, FieldMap, NamespaceDescriptor, NoopNotifier, TypeRegistry};
//!
//! # async fn demo() -> rucms::ContentResult<()> {
//! let registry = TypeRegistry::new().register(NamespaceDescriptor::new("Post"));
//! let engine = ContentEngine::open(EngineConfig::default(), registry, Arc::new(NoopNotifier))?;
//!
//! let mut fields = FieldMap::new();
//! fields.set("title", "Hello World");
//! let id = engine.repository().insert("Post", fields, Consistency::Eventual)?;
//! let raw = engine.repository().get("Post", &id.to_string())?;
//! # let _ = raw;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod engine;
pub mod error;
pub mod index;
pub mod query;
pub mod repository;
pub mod search;
pub mod storage;

// Re-export main types at crate root for convenience
pub use codec::{FieldMap, NamespaceDescriptor, Record, TypeRegistry};
pub use engine::{ContentEngine, EngineConfig};
pub use error::{ContentError, ContentResult};
pub use query::{FilterMode, Order, Page, QueryEngine, QueryOptions};
pub use repository::{Consistency, ContentRepository, Target};
pub use search::{NoopNotifier, SearchNotifier};
pub use storage::{Backend, Namespace};
