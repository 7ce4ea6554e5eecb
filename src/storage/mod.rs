//! Storage layer: the sled backend plus the naming rules that map namespaces
//! onto sled trees.
//!
//! A namespace such as `Post` owns up to three trees: the primary bucket
//! `Post`, the `Post__pending` variant and the derived `Post__sorted` index.
//! Sub-collections live in `Post::<field>` trees keyed by record id, so they
//! never show up while iterating the primary bucket.

pub mod backend;

pub use backend::{
    id_key, key_id, Backend, BackendConfig, BackendError, BackendResult, CONTENT_INDEX_TREE,
    SEQUENCE_TREE,
};

use std::fmt;

/// Separator between a content type and its specifier.
pub const SPECIFIER_SEPARATOR: &str = "__";

/// Specifier of the derived, time-sorted variant.
pub const SORTED: &str = "sorted";

/// Specifier of the pending (unapproved) variant.
pub const PENDING: &str = "pending";

/// A parsed namespace: content type name plus optional storage specifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    kind: String,
    specifier: Option<String>,
}

impl Namespace {
    /// Parses `Post`, `Post__pending` or `Post__sorted`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        if raw.starts_with(SPECIFIER_SEPARATOR) {
            return Err(format!("namespace {} uses a reserved prefix", raw));
        }
        if raw.contains(':') {
            return Err(format!("namespace {} must not contain ':'", raw));
        }

        match raw.split_once(SPECIFIER_SEPARATOR) {
            Some((kind, specifier)) if !specifier.is_empty() => Ok(Self {
                kind: kind.to_string(),
                specifier: Some(specifier.to_string()),
            }),
            Some(_) => Err(format!("namespace {} has an empty specifier", raw)),
            None => Ok(Self {
                kind: raw.to_string(),
                specifier: None,
            }),
        }
    }

    /// The primary variant of a content type.
    pub fn primary(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            specifier: None,
        }
    }

    /// Content type name with the specifier stripped.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn specifier(&self) -> Option<&str> {
        self.specifier.as_deref()
    }

    /// Only the primary variant takes part in the slug index and sort refresh.
    pub fn is_primary(&self) -> bool {
        self.specifier.is_none()
    }

    /// Records are written into the primary and pending variants only; every
    /// other specifier names derived data.
    pub fn is_writable(&self) -> bool {
        matches!(self.specifier.as_deref(), None | Some(PENDING))
    }

    /// Name of the tree holding this variant.
    pub fn bucket(&self) -> String {
        match &self.specifier {
            Some(s) => format!("{}{}{}", self.kind, SPECIFIER_SEPARATOR, s),
            None => self.kind.clone(),
        }
    }

    /// Name of the derived sorted tree for this content type.
    pub fn sorted_bucket(&self) -> String {
        format!("{}{}{}", self.kind, SPECIFIER_SEPARATOR, SORTED)
    }

    /// Name of the tree holding the `field` sub-collection of this variant.
    pub fn subcollection_bucket(&self, field: &str) -> String {
        format!("{}::{}", self.bucket(), field)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bucket())
    }
}
