//! Slug index: one shared tree mapping `slug -> "namespace:id"`.
//!
//! Claims and releases happen inside the same sled transaction as the primary
//! write, so probing for a free slug and taking it cannot race with another
//! insert.

use crate::error::{ContentError, ContentResult};
use crate::storage::Backend;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use std::sync::Arc;

/// Upper bound on `-N` suffixes tried before giving up.
pub const MAX_SLUG_SUFFIXES: u64 = 100_000;

type TxResult<T> = Result<T, ConflictableTransactionError<ContentError>>;

/// Read side of the slug index plus the transactional claim helpers.
#[derive(Clone)]
pub struct SlugIndex {
    backend: Arc<Backend>,
}

impl SlugIndex {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    /// Resolves a slug to its `(namespace, id)`.
    pub fn resolve(&self, slug: &str) -> ContentResult<(String, u64)> {
        match self.backend.content_index().get(slug.as_bytes())? {
            Some(raw) => parse_entry(slug, &raw),
            None => Err(ContentError::NotFound(format!("slug {}", slug))),
        }
    }

    /// First free slug among `candidate`, `candidate-1`, `candidate-2`, ...
    /// Only a snapshot answer; writers use [`SlugIndex::claim`].
    pub fn ensure_unique(&self, candidate: &str) -> ContentResult<String> {
        let index = self.backend.content_index();
        first_free(candidate, |slug| Ok(index.contains_key(slug.as_bytes())?))
    }

    /// Finds a free slug inside a write transaction and points it at `target`.
    pub fn claim(tx: &TransactionalTree, candidate: &str, target: &str) -> TxResult<String> {
        let slug = first_free_tx(tx, candidate)?;
        tx.insert(slug.as_bytes(), target.as_bytes())?;
        Ok(slug)
    }

    /// Drops `slug` if it still points at `target`.
    pub fn release(tx: &TransactionalTree, slug: &str, target: &str) -> TxResult<()> {
        if let Some(current) = tx.get(slug.as_bytes())? {
            if &current[..] == target.as_bytes() {
                tx.remove(slug.as_bytes())?;
            }
        }
        Ok(())
    }
}

fn first_free_tx(tx: &TransactionalTree, candidate: &str) -> TxResult<String> {
    let mut slug = candidate.to_string();
    for n in 1..=MAX_SLUG_SUFFIXES {
        if tx.get(slug.as_bytes())?.is_none() {
            return Ok(slug);
        }
        slug = format!("{}-{}", candidate, n);
    }
    Err(ConflictableTransactionError::Abort(
        ContentError::DuplicateSlugExhausted(candidate.to_string()),
    ))
}

fn first_free<F>(candidate: &str, mut exists: F) -> ContentResult<String>
where
    F: FnMut(&str) -> ContentResult<bool>,
{
    let mut slug = candidate.to_string();
    for n in 1..=MAX_SLUG_SUFFIXES {
        if !exists(&slug)? {
            return Ok(slug);
        }
        slug = format!("{}-{}", candidate, n);
    }
    Err(ContentError::DuplicateSlugExhausted(candidate.to_string()))
}

fn parse_entry(slug: &str, raw: &[u8]) -> ContentResult<(String, u64)> {
    let entry = std::str::from_utf8(raw)
        .map_err(|_| ContentError::Internal(format!("bad content index entry for slug {}", slug)))?;
    let (namespace, id) = entry
        .split_once(':')
        .ok_or_else(|| ContentError::Internal(format!("bad content index entry for slug {}", slug)))?;
    let id = id
        .parse()
        .map_err(|_| ContentError::InvalidId(format!("{} (slug {})", id, slug)))?;
    Ok((namespace.to_string(), id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendConfig;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Backend>, SlugIndex) {
        let temp_dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let index = SlugIndex::new(backend.clone());
        (temp_dir, backend, index)
    }

    fn claim(backend: &Backend, candidate: &str, target: &str) -> String {
        let result: sled::transaction::TransactionResult<String, ContentError> = backend
            .content_index()
            .transaction(|tx| SlugIndex::claim(tx, candidate, target));
        result.unwrap()
    }

    #[test]
    fn test_claim_suffixes_duplicates() {
        let (_dir, backend, index) = setup();

        assert_eq!(claim(&backend, "hello-world", "Post:1"), "hello-world");
        assert_eq!(claim(&backend, "hello-world", "Post:2"), "hello-world-1");
        assert_eq!(claim(&backend, "hello-world", "Post:3"), "hello-world-2");

        assert_eq!(index.resolve("hello-world-1").unwrap(), ("Post".to_string(), 2));
        assert_eq!(index.ensure_unique("hello-world").unwrap(), "hello-world-3");
    }

    #[test]
    fn test_release_only_own_entry() {
        let (_dir, backend, index) = setup();
        claim(&backend, "about", "Page:1");

        let result: sled::transaction::TransactionResult<(), ContentError> =
            backend
                .content_index()
                .transaction(|tx| SlugIndex::release(tx, "about", "Page:2"));
        result.unwrap();
        assert!(index.resolve("about").is_ok());

        let result: sled::transaction::TransactionResult<(), ContentError> = backend
            .content_index()
            .transaction(|tx| SlugIndex::release(tx, "about", "Page:1"));
        result.unwrap();
        assert!(matches!(index.resolve("about"), Err(ContentError::NotFound(_))));
        assert_eq!(index.ensure_unique("about").unwrap(), "about");
    }

    #[test]
    fn test_resolve_missing() {
        let (_dir, _backend, index) = setup();
        assert!(matches!(index.resolve("nope"), Err(ContentError::NotFound(_))));
    }
}
