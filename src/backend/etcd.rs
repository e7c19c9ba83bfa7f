//! etcd v3 backend built on the `etcd-client` gRPC client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::Client;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::KeyValue;
use etcd_client::LeaseKeepAliveStream;
use etcd_client::PutOptions;
use etcd_client::SortOrder;
use etcd_client::SortTarget;
use etcd_client::WatchOptions;
use futures::Stream;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::Backend;
use super::BackendEvent;
use super::EventKind;
use super::EventStream;
use super::LeaseId;
use super::LeaseKeeper;
use crate::Error;
use crate::KVPair;
use crate::LeaseError;
use crate::Result;
use crate::StoreConfig;
use crate::WatchError;

/// etcd v3 backend
///
/// Owns the client handle exclusively; [`Backend::close`] drops it, ends
/// every event stream handed out by [`Backend::watch`], and every later call
/// fails with [`Error::StoreClosed`].
pub struct EtcdBackend {
    client: RwLock<Option<Client>>,
    closed: CancellationToken,
}

impl EtcdBackend {
    /// Connect to the configured endpoints and verify one of them answers
    /// within the dial timeout
    ///
    /// # Errors
    /// - [`Error::NotReachable`] when no endpoint answers in time
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let dial_timeout = config.dial_timeout();
        let options = connect_options(config);

        let client =
            match tokio::time::timeout(dial_timeout, Client::connect(config.endpoints.clone(), Some(options)))
                .await
            {
                Ok(Ok(client)) => client,
                Ok(Err(e)) => {
                    error!(endpoints = ?config.endpoints, "etcd connect failed: {:?}", e);
                    return Err(Error::NotReachable {
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    error!(endpoints = ?config.endpoints, "etcd connect timed out");
                    return Err(Error::NotReachable {
                        reason: format!("connect timed out after {dial_timeout:?}"),
                    });
                }
            };

        probe(&client, dial_timeout).await?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self {
            client: RwLock::new(Some(client)),
            closed: CancellationToken::new(),
        })
    }

    fn client(&self) -> Result<Client> {
        self.client.read().clone().ok_or(Error::StoreClosed)
    }
}

/// Connect options derived from the store configuration
///
/// Credentials are applied only when both halves are present; the custom
/// hook runs last.
pub(crate) fn connect_options(config: &StoreConfig) -> ConnectOptions {
    let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout());

    if let Some((user, password)) = config.credentials() {
        options = options.with_user(user, password);
    }

    if let Some(hook) = &config.custom_backend_set {
        options = hook.apply(options);
    }

    options
}

/// Issue a cheap count-only read to make sure the cluster answers
///
/// Any reply from the server, including permission errors, proves the
/// endpoint reachable.
async fn probe(
    client: &Client,
    dial_timeout: Duration,
) -> Result<()> {
    let mut kv = client.kv_client();
    let request = kv.get("/", Some(GetOptions::new().with_count_only()));

    match tokio::time::timeout(dial_timeout, request).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if is_unreachable(&e) => Err(Error::NotReachable {
            reason: e.to_string(),
        }),
        Ok(Err(e)) => {
            debug!("etcd probe answered with error, endpoint reachable: {:?}", e);
            Ok(())
        }
        Err(_) => Err(Error::NotReachable {
            reason: format!("no response within {dial_timeout:?}"),
        }),
    }
}

/// End `events` once `closed` fires, even if the server keeps sending
///
/// Each stream holds its own clone of the gRPC channel, so dropping the
/// client alone would leave it running.
pub(crate) fn until_closed<S>(
    events: S,
    closed: &CancellationToken,
) -> EventStream
where
    S: Stream<Item = Result<Vec<BackendEvent>>> + Send + 'static,
{
    Box::pin(events.take_until(closed.clone().cancelled_owned()))
}

pub(crate) fn is_unreachable(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => true,
        etcd_client::Error::GRpcStatus(status) => matches!(
            status.code(),
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled
        ),
        _ => false,
    }
}

pub(crate) fn map_error(
    operation: &'static str,
    err: etcd_client::Error,
) -> Error {
    Error::backend(operation, err)
}

fn to_pair(kv: &KeyValue) -> KVPair {
    KVPair {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: Bytes::copy_from_slice(kv.value()),
        last_index: kv.mod_revision().max(0) as u64,
    }
}

fn to_event(event: &etcd_client::Event) -> Option<BackendEvent> {
    let kv = event.kv()?;
    let mut pair = to_pair(kv);
    let kind = match event.event_type() {
        EventType::Put => EventKind::Put,
        EventType::Delete => {
            pair.value = Bytes::new();
            EventKind::Delete
        }
    };
    Some(BackendEvent { kind, kv: pair })
}

#[async_trait]
impl Backend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<u64> {
        let mut kv = self.client()?.kv_client();
        let options = lease.map(|id| PutOptions::new().with_lease(id));

        let response = kv.put(key, value, options).await.map_err(|e| map_error("put", e))?;
        Ok(response.header().map(|h| h.revision().max(0) as u64).unwrap_or_default())
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KVPair>> {
        let mut kv = self.client()?.kv_client();

        let response = kv.get(key, None).await.map_err(|e| map_error("get", e))?;
        Ok(response.kvs().first().map(to_pair))
    }

    async fn range(
        &self,
        prefix: &str,
    ) -> Result<Vec<KVPair>> {
        let mut kv = self.client()?.kv_client();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);

        let response = kv.get(prefix, Some(options)).await.map_err(|e| map_error("range", e))?;
        Ok(response.kvs().iter().map(to_pair).collect())
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<u64> {
        let mut kv = self.client()?.kv_client();

        let response = kv.delete(key, None).await.map_err(|e| map_error("delete", e))?;
        Ok(response.deleted().max(0) as u64)
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<u64> {
        let mut kv = self.client()?.kv_client();
        let options = DeleteOptions::new().with_prefix();

        let response = kv
            .delete(prefix, Some(options))
            .await
            .map_err(|e| map_error("delete_prefix", e))?;
        Ok(response.deleted().max(0) as u64)
    }

    async fn watch(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<EventStream> {
        let mut client = self.client()?.watch_client();
        let options = prefix.then(|| WatchOptions::new().with_prefix());

        let (watcher, stream) = client.watch(key, options).await.map_err(|e| map_error("watch", e))?;

        // The watcher travels with the stream: dropping both tears the watch down.
        let state = (watcher, stream, key.to_string(), false);
        let events = futures::stream::unfold(state, |(watcher, mut stream, key, done)| async move {
            if done {
                return None;
            }
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            let err = WatchError::Canceled {
                                key: key.clone(),
                                reason: response.cancel_reason().to_string(),
                            };
                            return Some((Err(err.into()), (watcher, stream, key, true)));
                        }

                        // creation acks and progress notifications carry no events
                        let batch: Vec<BackendEvent> =
                            response.events().iter().filter_map(to_event).collect();
                        if batch.is_empty() {
                            continue;
                        }
                        return Some((Ok(batch), (watcher, stream, key, false)));
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        let err = WatchError::Stream {
                            key: key.clone(),
                            reason: e.to_string(),
                        };
                        return Some((Err(err.into()), (watcher, stream, key, true)));
                    }
                }
            }
        });

        Ok(until_closed(events, &self.closed))
    }

    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseId> {
        let mut lease = self.client()?.lease_client();

        let response = lease.grant(ttl, None).await.map_err(|e| map_error("grant", e))?;
        Ok(response.id())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<Box<dyn LeaseKeeper>> {
        let mut client = self.client()?.lease_client();

        let (keeper, stream) = client.keep_alive(lease).await.map_err(|e| map_error("keep_alive", e))?;
        Ok(Box::new(EtcdLeaseKeeper {
            lease_id: lease,
            keeper,
            stream,
        }))
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        let mut client = self.client()?.lease_client();

        client.revoke(lease).await.map_err(|e| map_error("revoke", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        if self.client.write().take().is_some() {
            debug!("etcd client released");
        }
        Ok(())
    }
}

struct EtcdLeaseKeeper {
    lease_id: LeaseId,
    keeper: etcd_client::LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeeper for EtcdLeaseKeeper {
    fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    async fn renew(&mut self) -> Result<i64> {
        self.keeper.keep_alive().await.map_err(|e| map_error("keep_alive", e))?;

        match self.stream.message().await {
            Ok(Some(response)) if response.ttl() > 0 => Ok(response.ttl()),
            Ok(Some(_)) => Err(LeaseError::KeepAlive {
                lease_id: self.lease_id,
                reason: "lease expired or revoked".to_string(),
            }
            .into()),
            Ok(None) => Err(LeaseError::KeepAlive {
                lease_id: self.lease_id,
                reason: "keepalive stream closed".to_string(),
            }
            .into()),
            Err(e) => Err(map_error("keep_alive", e)),
        }
    }
}
