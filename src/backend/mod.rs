//! Coordination backends
//!
//! The [`Backend`] trait is the narrow set of primitives every coordination
//! service is expected to provide: put/get/delete, prefix range and delete,
//! watch streams and TTL leases. The store layer builds its contract on top
//! of these and never talks to a concrete client directly.
//!
//! # Implementations
//! - [`EtcdBackend`] - etcd v3 over gRPC
//! - [`MemoryBackend`] - in-process MVCC store for embedded use and tests
//! - [`NamespacedBackend`] - key-prefix isolation wrapper around any backend

mod etcd;
mod memory;
mod namespace;

pub use etcd::*;
pub use memory::*;
pub use namespace::*;

#[cfg(test)]
mod etcd_test;

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::Error;
use crate::KVPair;
use crate::Result;
use crate::StoreConfig;

/// Backend lease identifier
pub type LeaseId = i64;

/// Longest lease ttl in seconds, the same ceiling etcd enforces
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

/// Kind of mutation carried by a [`BackendEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single mutation observed on a watch stream
///
/// For deletes `kv.value` is empty and `kv.last_index` is the revision of
/// the deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub kind: EventKind,
    pub kv: KVPair,
}

/// Native event stream of a backend watch
///
/// Yields one batch per backend notification. Dropping the stream releases
/// the backend watch.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Vec<BackendEvent>>> + Send>>;

/// One renewal handle for a granted lease
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseKeeper: Send {
    fn lease_id(&self) -> LeaseId;

    /// Perform one keepalive round-trip, returning the remaining TTL in seconds
    async fn renew(&mut self) -> Result<i64>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Unconditional upsert, returns the revision of the write
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<u64>;

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KVPair>>;

    /// Every key starting with `prefix`, ascending by key
    async fn range(
        &self,
        prefix: &str,
    ) -> Result<Vec<KVPair>>;

    /// Returns the number of deleted keys
    async fn delete(
        &self,
        key: &str,
    ) -> Result<u64>;

    /// Returns the number of deleted keys
    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<u64>;

    async fn watch(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<EventStream>;

    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseId>;

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<Box<dyn LeaseKeeper>>;

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()>;

    /// Release the client; later calls fail with [`Error::StoreClosed`]
    async fn close(&self) -> Result<()>;
}

/// Explicit backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Etcd,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            BackendKind::Etcd => f.write_str("etcd"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" | "etcdv3" => Ok(BackendKind::Etcd),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(Error::BackendNotSupported(other.to_string())),
        }
    }
}

/// Build the backend selected by `kind`, scoped to the configured namespace
pub async fn connect(
    kind: BackendKind,
    config: &StoreConfig,
) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Etcd => Arc::new(EtcdBackend::connect(config).await?),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };

    if config.namespace.is_empty() {
        return Ok(backend);
    }

    info!(namespace = %config.namespace, backend = %kind, "Applying namespace scoping");
    Ok(Arc::new(NamespacedBackend::new(backend, config.namespace.clone())))
}
