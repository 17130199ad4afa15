use std::path::PathBuf;

use lb_core::{AggregateError, BoxError, Cancelled};
use lb_crypto::CryptoError;
use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Container {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Container {name} would grow to {size} bytes, over the {limit} byte quota")]
    QuotaExceeded { name: String, size: u64, limit: u64 },

    #[error("Invalid container name {0:?}: use letters, digits, '.', '_' or '-'")]
    InvalidName(String),

    #[error("Container encoding failed: {0}")]
    Format(String),

    #[error("Engine task ended without reporting a result")]
    Interrupted,

    #[error("Backend failure: {0}")]
    Backend(String),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open container {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("Invalid container version {0}: versions start at 1")]
    InvalidVersion(u32),

    #[error("Container {name} is at version {stored}, newer than the requested {requested}")]
    VersionConflict {
        name: String,
        stored: u32,
        requested: u32,
    },

    #[error("Container {0} is in use by another open handle")]
    Blocked(String),

    #[error("Migration to version {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Transaction aborted: {reason}")]
    TransactionAborted {
        reason: String,
        #[source]
        source: Option<EngineError>,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("Encryption failed: {0}")]
    Encrypt(#[source] CryptoError),

    #[error("Decryption failed: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("Record not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error(transparent)]
    Custom(BoxError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Collection {0} is outside the transaction scope")]
    NotInScope(String),

    #[error("Write to {0} inside a read-only transaction")]
    ReadOnly(String),

    #[error("Store handle is closed")]
    Closed,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl StoreError {
    /// Wrap a caller-defined error, e.g. a facade's own "not found" type.
    pub fn custom<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Custom(Box::new(err))
    }

    pub(crate) fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Downcast a [`StoreError::Custom`] payload.
    pub fn downcast_custom<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Custom(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_error_keeps_cause() {
        let err = StoreError::Migration {
            version: 3,
            source: Box::new(StoreError::Codec("bad payload".into())),
        };
        assert_eq!(
            lb_core::error::display_chain(&err),
            "Migration to version 3 failed: Codec error: bad payload"
        );
    }

    #[test]
    fn custom_errors_downcast() {
        #[derive(Debug, Error)]
        #[error("no settings yet")]
        struct NoSettings;

        let err = StoreError::custom(NoSettings);
        assert!(err.downcast_custom::<NoSettings>().is_some());
        assert_eq!(err.to_string(), "no settings yet");
        assert!(StoreError::Closed.downcast_custom::<NoSettings>().is_none());
    }

    #[test]
    fn cancellation_converts() {
        let err: StoreError = Cancelled::DeadlineExceeded.into();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "context deadline exceeded");
    }
}
