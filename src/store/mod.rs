//! Backend-agnostic store contract
//!
//! [`Store`] is the small interface application code depends on. [`KvStore`]
//! implements it over any [`crate::Backend`], owning the session: the client
//! handle, the optional session lease and the stop signal shared by every
//! watch task.

mod builder;
mod keys;
mod kv_store;
mod lease;
mod watch;

pub use builder::*;
pub use keys::*;
pub use kv_store::*;
pub(crate) use lease::*;

#[cfg(test)]
mod lease_test;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A key, its value and the backend revision of its last mutation
///
/// An empty `value` delivered on a single-key watch means the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KVPair {
    pub key: String,
    pub value: Bytes,
    /// Backend revision of the last mutation of `key`, opaque to callers
    pub last_index: u64,
}

impl KVPair {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Bytes>,
        last_index: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_index,
        }
    }

    /// True for the deletion marker delivered by single-key watches
    pub fn is_deleted(&self) -> bool {
        self.value.is_empty()
    }
}

/// Optional operations a store supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `new_lock` returns a working [`Locker`]
    pub locks: bool,
    /// `atomic_put` / `atomic_delete` perform compare-and-swap
    pub atomic: bool,
}

/// Parameters of a distributed lock
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Value stored under the lock key while held
    pub value: Bytes,
    /// Lock TTL, the lock is lost if the holder stops renewing
    pub ttl: Option<Duration>,
    /// Cancel to stop renewing a held lock
    pub renew_lock: Option<CancellationToken>,
}

/// Handle of one distributed lock
#[async_trait]
pub trait Locker: Send {
    /// Block until the lock is held or `cancel` fires
    ///
    /// The returned channel closes when the lock is lost.
    async fn lock(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<()>>;

    async fn unlock(&mut self) -> Result<()>;
}

/// Key-value coordination store
///
/// Keys are normalized with [`normalize`] before reaching the backend, so
/// `"/a/b"` and `"a/b"` address the same node.
#[async_trait]
pub trait Store: Send + Sync {
    /// Unconditional upsert
    async fn put(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()>;

    /// # Errors
    /// - [`crate::Error::KeyNotFound`] when the key is absent
    async fn get(
        &self,
        key: &str,
    ) -> Result<KVPair>;

    /// Deleting an absent key fails with [`crate::Error::KeyNotFound`]
    async fn delete(
        &self,
        key: &str,
    ) -> Result<()>;

    async fn exists(
        &self,
        key: &str,
    ) -> Result<bool>;

    /// Watch a single key
    ///
    /// The current value is the first message. Each later mutation is one
    /// message; a deletion arrives with an empty value. The channel closes
    /// when `cancel` fires, the store closes, or the backend stream fails.
    async fn watch(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<KVPair>>;

    /// Watch every key below `prefix`
    ///
    /// Every message is the complete current listing, starting with the
    /// listing at subscription time.
    async fn watch_tree(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KVPair>>>;

    /// Children of `prefix` ascending by key, excluding `prefix` itself
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KVPair>>;

    async fn delete_tree(
        &self,
        prefix: &str,
    ) -> Result<()>;

    async fn new_lock(
        &self,
        key: &str,
        options: LockOptions,
    ) -> Result<Box<dyn Locker>>;

    /// Compare-and-swap put, returns whether it applied and the new pair
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KVPair>,
    ) -> Result<(bool, KVPair)>;

    async fn atomic_delete(
        &self,
        key: &str,
        previous: Option<&KVPair>,
    ) -> Result<bool>;

    fn capabilities(&self) -> Capabilities;

    /// Release the session, safe to call more than once
    async fn close(&self);
}
