use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use super::Backend;
use super::BackendEvent;
use super::EventStream;
use super::LeaseId;
use super::LeaseKeeper;
use crate::KVPair;
use crate::Result;

/// Scopes every key of the wrapped backend under a fixed prefix
///
/// The prefix is concatenated as-is; callers wanting a `/` boundary include
/// it in the namespace. Keys handed back to callers have the prefix removed.
pub struct NamespacedBackend {
    inner: Arc<dyn Backend>,
    prefix: String,
}

impl NamespacedBackend {
    pub fn new(
        inner: Arc<dyn Backend>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn scoped(
        &self,
        key: &str,
    ) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn unscope(
        prefix: &str,
        mut pair: KVPair,
    ) -> KVPair {
        if let Some(stripped) = pair.key.strip_prefix(prefix) {
            pair.key = stripped.to_string();
        }
        pair
    }
}

#[async_trait]
impl Backend for NamespacedBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<u64> {
        self.inner.put(&self.scoped(key), value, lease).await
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KVPair>> {
        let pair = self.inner.get(&self.scoped(key)).await?;
        Ok(pair.map(|p| Self::unscope(&self.prefix, p)))
    }

    async fn range(
        &self,
        prefix: &str,
    ) -> Result<Vec<KVPair>> {
        let pairs = self.inner.range(&self.scoped(prefix)).await?;
        Ok(pairs
            .into_iter()
            .map(|p| Self::unscope(&self.prefix, p))
            .collect())
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<u64> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<u64> {
        self.inner.delete_prefix(&self.scoped(prefix)).await
    }

    async fn watch(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<EventStream> {
        let events = self.inner.watch(&self.scoped(key), prefix).await?;
        let namespace = self.prefix.clone();

        let events = events.map(move |batch| {
            batch.map(|events| {
                events
                    .into_iter()
                    .map(|event| BackendEvent {
                        kind: event.kind,
                        kv: Self::unscope(&namespace, event.kv),
                    })
                    .collect()
            })
        });
        Ok(Box::pin(events))
    }

    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseId> {
        self.inner.grant(ttl).await
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<Box<dyn LeaseKeeper>> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        self.inner.revoke(lease).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
