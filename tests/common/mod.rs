#![allow(dead_code)]

use std::time::Duration;

use kvstore::BackendKind;
use kvstore::KvStore;
use kvstore::Result;
use tokio::sync::mpsc;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Endpoints of a live etcd named by `KVSTORE_TEST_ENDPOINTS`, comma separated
pub fn etcd_endpoints() -> Option<Vec<String>> {
    let raw = std::env::var("KVSTORE_TEST_ENDPOINTS").ok()?;
    let endpoints: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect();
    (!endpoints.is_empty()).then_some(endpoints)
}

pub async fn memory_store(namespace: &str) -> Result<KvStore> {
    KvStore::builder(BackendKind::Memory)
        .namespace(namespace)
        .lease_seconds(0)
        .close_grace(Duration::from_millis(500))
        .build()
        .await
}

/// Next message or `None` if the channel closed; panics when nothing arrives in time
pub async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("watch message did not arrive in time")
}

/// Asserts nothing is delivered for `window`
pub async fn assert_quiet<T: std::fmt::Debug>(
    rx: &mut mpsc::Receiver<T>,
    window: Duration,
) {
    if let Ok(message) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected watch message: {message:?}");
    }
}
