use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;
use tracing::Span;

use super::normalize;
use super::watch::stream_key;
use super::watch::stream_tree;
use super::watch::Subscription;
use super::Capabilities;
use super::LeaseManager;
use super::LockOptions;
use super::Locker;
use super::Store;
use super::StoreBuilder;
use crate::backend;
use crate::metrics::record_outcome;
use crate::metrics::OpTimer;
use crate::Backend;
use crate::BackendKind;
use crate::Error;
use crate::KVPair;
use crate::LeaseId;
use crate::Result;
use crate::StoreConfig;

/// Children of `prefix` ascending by key, without `prefix` itself
///
/// # Errors
/// - [`Error::KeyNotFound`] when nothing lives below `prefix`
pub(crate) async fn list_children(
    backend: &dyn Backend,
    prefix: &str,
) -> Result<Vec<KVPair>> {
    let mut pairs = backend.range(prefix).await?;
    pairs.retain(|pair| pair.key != prefix);
    if pairs.is_empty() {
        return Err(Error::KeyNotFound);
    }
    pairs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(pairs)
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    lease: Mutex<Option<LeaseManager>>,
    stop: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    span: Span,
}

/// [`Store`] over any [`Backend`]
///
/// Cloning is cheap and every clone shares the session.
///
/// # Example
/// ```no_run
/// use kvstore::{BackendKind, KvStore, Store};
///
/// # async fn run() -> kvstore::Result<()> {
/// let store = KvStore::builder(BackendKind::Etcd)
///     .endpoints(vec!["10.0.0.1:2379".into()])
///     .namespace("app/")
///     .lease_seconds(10)
///     .build()
///     .await?;
///
/// store.put("service/a", b"10.0.0.7:80").await?;
/// let pair = store.get("service/a").await?;
/// assert_eq!(&pair.value[..], b"10.0.0.7:80");
/// store.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Inner>,
}

impl KvStore {
    pub fn builder(kind: BackendKind) -> StoreBuilder {
        StoreBuilder::new(kind)
    }

    /// Validate `config`, connect the selected backend and open a session
    pub async fn open(
        kind: BackendKind,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let span = config
            .logger
            .clone()
            .unwrap_or_else(|| info_span!("kvstore", backend = %kind));

        let backend = backend::connect(kind, &config).instrument(span.clone()).await?;
        Self::with_backend(backend, config).await
    }

    /// Open a session over an already connected backend
    ///
    /// Acquires the session lease when `lease_seconds > 0`. If that fails
    /// the backend is closed before the error is returned.
    pub async fn with_backend(
        backend: Arc<dyn Backend>,
        config: StoreConfig,
    ) -> Result<Self> {
        let span = config
            .logger
            .clone()
            .unwrap_or_else(|| info_span!("kvstore", backend = backend.name()));

        let lease = match LeaseManager::acquire(&backend, config.lease_seconds, &span)
            .instrument(span.clone())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                span.in_scope(|| error!("Failed to open store session: {:?}", e));
                if let Err(close_err) = backend.close().await {
                    span.in_scope(|| warn!("Failed to close backend: {:?}", close_err));
                }
                return Err(e);
            }
        };

        span.in_scope(|| {
            info!(
                endpoints = ?config.endpoints,
                namespace = %config.namespace,
                lease_seconds = config.lease_seconds,
                "Store opened"
            )
        });

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                config,
                lease: Mutex::new(lease),
                stop: CancellationToken::new(),
                tracker: TaskTracker::new(),
                closed: AtomicBool::new(false),
                span,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Session lease id, `None` when leasing is disabled or keepalive failed
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.inner.lease.lock().as_ref().and_then(|lease| lease.lease_id())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    /// Run one foreground operation under the session span with metrics
    async fn observe<T, F>(
        &self,
        op: &'static str,
        key: &str,
        fut: F,
    ) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let _timer = OpTimer::new(op);
        let result = fut.instrument(self.inner.span.clone()).await;
        record_outcome(op, &result);

        if let Err(e) = &result {
            self.inner.span.in_scope(|| {
                if e.is_not_found() {
                    debug!(op, key, "Key not found");
                } else {
                    error!(op, key, "Store operation failed: {:?}", e);
                }
            });
        }
        result
    }

    async fn get_pair(
        &self,
        key: &str,
    ) -> Result<KVPair> {
        self.ensure_open()?;
        self.inner.backend.get(key).await?.ok_or(Error::KeyNotFound)
    }

    fn watch_channel<T>(&self) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        mpsc::channel(self.inner.config.watch_buffer_size.max(1))
    }
}

#[async_trait]
impl Store for KvStore {
    async fn put(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let key = normalize(key);
        self.observe("put", key, async {
            self.ensure_open()?;
            self.inner.backend.put(key, value, self.lease_id()).await?;
            Ok(())
        })
        .await
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<KVPair> {
        let key = normalize(key);
        self.observe("get", key, self.get_pair(key)).await
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let key = normalize(key);
        self.observe("delete", key, async {
            self.ensure_open()?;
            match self.inner.backend.delete(key).await? {
                0 => Err(Error::KeyNotFound),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn exists(
        &self,
        key: &str,
    ) -> Result<bool> {
        let key = normalize(key);
        self.observe("exists", key, async {
            match self.get_pair(key).await {
                Ok(_) => Ok(true),
                Err(Error::KeyNotFound) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn watch(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<KVPair>> {
        let key = normalize(key);
        let inner = &self.inner;

        let subscription = self
            .observe("watch", key, async {
                self.ensure_open()?;
                // opened before the baseline read so no mutation falls in between
                let events = inner.backend.watch(key, false).await?;
                let baseline = self.get_pair(key).await?;
                // close may have started while the baseline was read
                self.ensure_open()?;
                let (tx, rx) = self.watch_channel();
                Ok((events, baseline, tx, rx))
            })
            .await;
        let (events, baseline, tx, rx) = subscription?;

        let subscription = Subscription {
            target: key.to_string(),
            events,
            tx,
            cancel,
            stop: inner.stop.clone(),
        };
        inner
            .tracker
            .spawn(stream_key(subscription, baseline).instrument(inner.span.clone()));
        Ok(rx)
    }

    async fn watch_tree(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KVPair>>> {
        let prefix = normalize(prefix);
        let inner = &self.inner;

        let subscription = self
            .observe("watch_tree", prefix, async {
                self.ensure_open()?;
                let events = inner.backend.watch(prefix, true).await?;
                let baseline = list_children(inner.backend.as_ref(), prefix).await?;
                self.ensure_open()?;
                let (tx, rx) = self.watch_channel();
                Ok((events, baseline, tx, rx))
            })
            .await;
        let (events, baseline, tx, rx) = subscription?;

        let subscription = Subscription {
            target: prefix.to_string(),
            events,
            tx,
            cancel,
            stop: inner.stop.clone(),
        };
        inner.tracker.spawn(
            stream_tree(subscription, baseline, inner.backend.clone()).instrument(inner.span.clone()),
        );
        Ok(rx)
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KVPair>> {
        let prefix = normalize(prefix);
        self.observe("list", prefix, async {
            self.ensure_open()?;
            list_children(self.inner.backend.as_ref(), prefix).await
        })
        .await
    }

    async fn delete_tree(
        &self,
        prefix: &str,
    ) -> Result<()> {
        let prefix = normalize(prefix);
        self.observe("delete_tree", prefix, async {
            self.ensure_open()?;
            match self.inner.backend.delete_prefix(prefix).await? {
                0 => Err(Error::KeyNotFound),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn new_lock(
        &self,
        _key: &str,
        _options: LockOptions,
    ) -> Result<Box<dyn Locker>> {
        Err(Error::Unimplemented { operation: "new_lock" })
    }

    async fn atomic_put(
        &self,
        _key: &str,
        _value: &[u8],
        _previous: Option<&KVPair>,
    ) -> Result<(bool, KVPair)> {
        Err(Error::Unimplemented {
            operation: "atomic_put",
        })
    }

    async fn atomic_delete(
        &self,
        _key: &str,
        _previous: Option<&KVPair>,
    ) -> Result<bool> {
        Err(Error::Unimplemented {
            operation: "atomic_delete",
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Stop every watch, revoke the lease, then release the backend
    ///
    /// Watches are stopped first: revoking the lease deletes the session's
    /// keys, and those deletions must not reach subscribers. Errors are
    /// logged, never returned. Waits up to `close_grace_ms` for watch tasks
    /// to finish.
    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;

        async {
            inner.stop.cancel();
            inner.tracker.close();

            let lease = inner.lease.lock().take();
            if let Some(mut lease) = lease {
                lease.release(&inner.backend).await;
            }

            if let Err(e) = inner.backend.close().await {
                warn!("Failed to close backend: {:?}", e);
            }

            let grace = inner.config.close_grace();
            if tokio::time::timeout(grace, inner.tracker.wait()).await.is_err() {
                warn!(
                    pending = inner.tracker.len(),
                    "Watch tasks still running after {:?}", grace
                );
            }

            info!("Store closed");
        }
        .instrument(inner.span.clone())
        .await
    }
}
