//! Store error types.

use thiserror::Error;

/// Errors from the context store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(#[from] wakestate_journal::JournalError),

    #[error("field '{field}' of machine '{machine}' could not be encoded: {source}")]
    Encode {
        machine: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("field '{field}' of machine '{machine}' could not be decoded: {source}")]
    Decode {
        machine: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Io(_) => true,
            StoreError::Journal(e) => e.is_retryable(),
            _ => false,
        }
    }
}
