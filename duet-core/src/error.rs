use thiserror::Error;

use crate::path::Path;

/// Errors raised by the document model and the CRDT binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("no node at path {0:?}")]
    InvalidPath(Path),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("crdt error: {0}")]
    Crdt(String),

    #[error("binding has been disposed")]
    Disposed,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<yrs::encoding::read::Error> for CoreError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CoreError::Crdt(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
