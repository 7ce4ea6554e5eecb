//! Error taxonomy shared by the repository, query and index layers.

use crate::codec::CodecError;
use crate::storage::BackendError;
use sled::transaction::TransactionError;
use thiserror::Error;

/// Errors surfaced to callers of the content engine.
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid ID: {0}")]
    InvalidId(String),

    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("No free slug derived from {0}")]
    DuplicateSlugExhausted(String),

    #[error("Store error: {0}")]
    Store(#[from] BackendError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ContentResult<T> = Result<T, ContentError>;

impl From<sled::Error> for ContentError {
    fn from(e: sled::Error) -> Self {
        ContentError::Store(BackendError::Sled(e))
    }
}

impl From<serde_json::Error> for ContentError {
    fn from(e: serde_json::Error) -> Self {
        ContentError::Decode(CodecError::Json(e))
    }
}

impl From<TransactionError<ContentError>> for ContentError {
    fn from(e: TransactionError<ContentError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => e.into(),
        }
    }
}
