//! Store Error Hierarchy
//!
//! Sentinel errors callers match on for control flow (`KeyNotFound` means
//! "absent", not "broken"), plus wrapped backend, lease and watch-stream
//! failures.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by backend failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The targeted key or prefix does not exist
    #[error("Key not found in store")]
    KeyNotFound,

    /// The value at key was modified since it was last read
    #[error("Unable to complete atomic operation, key modified")]
    KeyModified,

    /// The key is already present
    #[error("Key already exists")]
    KeyExists,

    /// A lock could not be acquired
    #[error("Error while trying to lock")]
    CannotLock,

    /// None of the configured endpoints answered
    #[error("Backend endpoints not reachable: {reason}")]
    NotReachable { reason: String },

    /// The operation is not supported by this backend
    #[error("Backend does not support the requested call")]
    CallNotSupported,

    /// No backend is registered under this name
    #[error("Backend storage not supported: {0}")]
    BackendNotSupported(String),

    /// An atomic operation needs the previous value to compare against
    #[error("Previous K/V pair should be provided for the atomic operation")]
    PreviousNotSpecified,

    /// Capability the store contract names but this store does not provide
    #[error("Operation {operation} is not implemented by this store")]
    Unimplemented { operation: &'static str },

    /// The session was closed
    #[error("Store is closed")]
    StoreClosed,

    /// Transport or server failure reported by the backend
    #[error("Backend {operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    /// Lease grant, keepalive or revoke failures
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Watch stream failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Failed to grant lease with ttl {ttl}s: {source}")]
    Grant {
        ttl: i64,
        #[source]
        source: BoxError,
    },

    #[error("Keepalive for lease {lease_id} failed: {reason}")]
    KeepAlive { lease_id: i64, reason: String },

    #[error("Failed to revoke lease {lease_id}: {source}")]
    Revoke {
        lease_id: i64,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The backend cancelled the watch (compaction, shutdown, explicit cancel)
    #[error("Watch on {key} canceled: {reason}")]
    Canceled { key: String, reason: String },

    /// Any other failure of the event stream
    #[error("Watch stream on {key} failed: {reason}")]
    Stream { key: String, reason: String },
}

impl Error {
    /// Wraps an arbitrary backend failure
    pub fn backend(
        operation: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        Error::Backend {
            operation,
            source: source.into(),
        }
    }

    /// True for [`Error::KeyNotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound)
    }

    /// True when a watch stream ended because it was cancelled
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Watch(WatchError::Canceled { .. }))
    }
}
