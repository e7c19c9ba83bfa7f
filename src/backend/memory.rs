//! In-process backend with etcd-like revision, lease and watch semantics.
//!
//! - Every mutation bumps one global revision; `last_index` is the key's
//!   `mod_revision`.
//! - A prefix delete or a lease expiry is a single revision carrying one
//!   event per removed key.
//! - Watchers share one broadcast channel; a watcher that falls more than
//!   [`EVENT_BUFFER_SIZE`] batches behind gets a stream error.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use tracing::trace;

use super::Backend;
use super::BackendEvent;
use super::EventKind;
use super::EventStream;
use super::LeaseId;
use super::LeaseKeeper;
use super::MAX_LEASE_TTL;
use crate::Error;
use crate::KVPair;
use crate::LeaseError;
use crate::Result;
use crate::WatchError;

pub const EVENT_BUFFER_SIZE: usize = 1024;

type EventBatch = Arc<Vec<BackendEvent>>;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct MemLease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
struct MemState {
    data: BTreeMap<String, Entry>,
    revision: u64,
    leases: HashMap<LeaseId, MemLease>,
    next_lease_id: LeaseId,
    events: Option<broadcast::Sender<EventBatch>>,
}

impl MemState {
    fn ensure_open(&self) -> Result<()> {
        if self.events.is_none() {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    fn publish(
        &self,
        batch: Vec<BackendEvent>,
    ) {
        if batch.is_empty() {
            return;
        }
        if let Some(events) = &self.events {
            // no receivers is fine, nobody is watching
            let _ = events.send(Arc::new(batch));
        }
    }

    fn detach_from_lease(
        &mut self,
        key: &str,
        lease: Option<LeaseId>,
    ) {
        if let Some(lease) = lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
    }

    /// Drop every key attached to `lease_id` as one revision
    fn drop_lease(
        &mut self,
        lease_id: LeaseId,
    ) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };

        let removed: Vec<String> = lease
            .keys
            .into_iter()
            .filter(|key| self.data.contains_key(key))
            .collect();
        if removed.is_empty() {
            return true;
        }

        self.revision += 1;
        let revision = self.revision;
        let batch = removed
            .into_iter()
            .map(|key| {
                self.data.remove(&key);
                delete_event(key, revision)
            })
            .collect();
        self.publish(batch);
        true
    }

    fn expire_leases(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            debug!(lease_id, "Memory lease expired");
            self.drop_lease(lease_id);
        }
    }
}

fn delete_event(
    key: String,
    revision: u64,
) -> BackendEvent {
    BackendEvent {
        kind: EventKind::Delete,
        kv: KVPair {
            key,
            value: Bytes::new(),
            last_index: revision,
        },
    }
}

/// In-memory coordination backend
///
/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemState>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            state: Arc::new(Mutex::new(MemState {
                data: BTreeMap::new(),
                revision: 0,
                leases: HashMap::new(),
                next_lease_id: 1,
                events: Some(events),
            })),
        }
    }

    /// Current store revision
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Run `f` against open, lease-expired state
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut MemState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.expire_leases();
        f(&mut *state)
    }

    /// Expire `lease_id` once its deadline passes, even when nobody touches the store
    fn spawn_reaper(
        state: Weak<Mutex<MemState>>,
        lease_id: LeaseId,
    ) {
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(state) = state.upgrade() else {
                        return;
                    };
                    let state = state.lock();
                    match state.leases.get(&lease_id) {
                        Some(lease) if state.events.is_some() => lease.deadline,
                        _ => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(state) = state.upgrade() else {
                    return;
                };
                state.lock().expire_leases();
            }
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<u64> {
        self.with_state(|state| {
            if let Some(lease_id) = lease {
                if !state.leases.contains_key(&lease_id) {
                    return Err(Error::backend(
                        "put",
                        format!("requested lease {lease_id} not found"),
                    ));
                }
            }

            state.revision += 1;
            let revision = state.revision;
            let value = Bytes::copy_from_slice(value);

            let previous = state.data.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    mod_revision: revision,
                    lease,
                },
            );
            if let Some(previous) = previous {
                state.detach_from_lease(key, previous.lease);
            }
            if let Some(lease) = lease.and_then(|id| state.leases.get_mut(&id)) {
                lease.keys.insert(key.to_string());
            }

            trace!(key, revision, "Memory put");
            state.publish(vec![BackendEvent {
                kind: EventKind::Put,
                kv: KVPair {
                    key: key.to_string(),
                    value,
                    last_index: revision,
                },
            }]);
            Ok(revision)
        })
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KVPair>> {
        self.with_state(|state| {
            Ok(state.data.get(key).map(|entry| KVPair {
                key: key.to_string(),
                value: entry.value.clone(),
                last_index: entry.mod_revision,
            }))
        })
    }

    async fn range(
        &self,
        prefix: &str,
    ) -> Result<Vec<KVPair>> {
        self.with_state(|state| {
            Ok(state
                .data
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| KVPair {
                    key: key.clone(),
                    value: entry.value.clone(),
                    last_index: entry.mod_revision,
                })
                .collect())
        })
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<u64> {
        self.with_state(|state| {
            let Some(previous) = state.data.remove(key) else {
                return Ok(0);
            };
            state.detach_from_lease(key, previous.lease);

            state.revision += 1;
            let revision = state.revision;
            state.publish(vec![delete_event(key.to_string(), revision)]);
            Ok(1)
        })
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<u64> {
        self.with_state(|state| {
            let keys: Vec<String> = state
                .data
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            if keys.is_empty() {
                return Ok(0);
            }

            state.revision += 1;
            let revision = state.revision;
            let mut batch = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(previous) = state.data.remove(&key) {
                    state.detach_from_lease(&key, previous.lease);
                }
                batch.push(delete_event(key, revision));
            }

            let deleted = batch.len() as u64;
            state.publish(batch);
            Ok(deleted)
        })
    }

    async fn watch(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<EventStream> {
        let receiver = self.with_state(|state| {
            state
                .events
                .as_ref()
                .map(|events| events.subscribe())
                .ok_or(Error::StoreClosed)
        })?;

        let target = key.to_string();
        let events = BroadcastStream::new(receiver).filter_map(move |item| {
            let result = match item {
                Ok(batch) => {
                    let matching: Vec<BackendEvent> = batch
                        .iter()
                        .filter(|event| {
                            if prefix {
                                event.kv.key.starts_with(&target)
                            } else {
                                event.kv.key == target
                            }
                        })
                        .cloned()
                        .collect();
                    (!matching.is_empty()).then_some(Ok(matching))
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(WatchError::Stream {
                    key: target.clone(),
                    reason: format!("watcher lagged behind by {missed} batches"),
                }
                .into())),
            };
            future::ready(result)
        });

        Ok(Box::pin(events))
    }

    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseId> {
        if ttl <= 0 || ttl > MAX_LEASE_TTL {
            return Err(Error::backend("grant", format!("invalid lease ttl {ttl}")));
        }

        let lease_id = self.with_state(|state| {
            let lease_id = state.next_lease_id;
            state.next_lease_id += 1;
            state.leases.insert(
                lease_id,
                MemLease {
                    ttl,
                    deadline: Instant::now() + Duration::from_secs(ttl as u64),
                    keys: BTreeSet::new(),
                },
            );
            Ok(lease_id)
        })?;

        Self::spawn_reaper(Arc::downgrade(&self.state), lease_id);
        debug!(lease_id, ttl, "Memory lease granted");
        Ok(lease_id)
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<Box<dyn LeaseKeeper>> {
        self.with_state(|state| {
            if state.leases.contains_key(&lease) {
                Ok(())
            } else {
                Err(Error::backend(
                    "keep_alive",
                    format!("requested lease {lease} not found"),
                ))
            }
        })?;

        Ok(Box::new(MemoryLeaseKeeper {
            backend: self.clone(),
            lease_id: lease,
        }))
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        self.with_state(|state| {
            if state.drop_lease(lease) {
                Ok(())
            } else {
                Err(Error::backend(
                    "revoke",
                    format!("requested lease {lease} not found"),
                ))
            }
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        // dropping the sender ends every open watch stream
        if state.events.take().is_some() {
            state.leases.clear();
            debug!("Memory backend closed");
        }
        Ok(())
    }
}

struct MemoryLeaseKeeper {
    backend: MemoryBackend,
    lease_id: LeaseId,
}

#[async_trait]
impl LeaseKeeper for MemoryLeaseKeeper {
    fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    async fn renew(&mut self) -> Result<i64> {
        let lease_id = self.lease_id;
        self.backend.with_state(|state| match state.leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
                Ok(lease.ttl)
            }
            None => Err(LeaseError::KeepAlive {
                lease_id,
                reason: "lease expired or revoked".to_string(),
            }
            .into()),
        })
    }
}
