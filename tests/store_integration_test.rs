//! End-to-end behaviour of the public store API over the in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::assert_quiet;
use common::memory_store;
use common::recv;
use kvstore::Error;
use kvstore::KvStore;
use kvstore::MemoryBackend;
use kvstore::Store;
use kvstore::StoreConfig;
use kvstore::StoreOption;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn put_get_delete_exists_scenario() {
    let store = memory_store("").await.unwrap();

    store.put("k1", b"v1").await.unwrap();
    store.put("k1", b"v2").await.unwrap();
    let pair = store.get("k1").await.unwrap();
    assert_eq!(pair.key, "k1");
    assert_eq!(&pair.value[..], b"v2");

    store.delete("k1").await.unwrap();
    assert!(matches!(store.get("k1").await, Err(Error::KeyNotFound)));
    assert!(!store.exists("k1").await.unwrap());

    store.close().await;
}

#[tokio::test]
async fn last_index_strictly_increases_per_write() {
    let store = memory_store("").await.unwrap();

    let mut previous = 0;
    for i in 0..5 {
        store.put("counter", i.to_string().as_bytes()).await.unwrap();
        let pair = store.get("counter").await.unwrap();
        assert!(pair.last_index > previous);
        previous = pair.last_index;
    }

    store.close().await;
}

#[tokio::test]
async fn list_is_sorted_and_never_contains_the_prefix() {
    let store = memory_store("").await.unwrap();
    for key in ["/services", "/services/web/2", "/services/api", "/services/web/1"] {
        store.put(key, b"up").await.unwrap();
    }

    let keys: Vec<String> = store
        .list("/services")
        .await
        .unwrap()
        .into_iter()
        .map(|kv| kv.key)
        .collect();

    assert_eq!(keys, vec!["services/api", "services/web/1", "services/web/2"]);
    store.close().await;
}

#[tokio::test]
async fn key_watch_follows_value_then_deletion() {
    let store = memory_store("").await.unwrap();
    store.put("feature/flag", b"v1").await.unwrap();
    let cancel = CancellationToken::new();
    let mut rx = store.watch("feature/flag", cancel.clone()).await.unwrap();

    assert_eq!(&recv(&mut rx).await.unwrap().value[..], b"v1");

    store.put("feature/flag", b"v2").await.unwrap();
    assert_eq!(&recv(&mut rx).await.unwrap().value[..], b"v2");

    store.delete("feature/flag").await.unwrap();
    let deleted = recv(&mut rx).await.unwrap();
    assert!(deleted.value.is_empty());

    cancel.cancel();
    assert!(recv(&mut rx).await.is_none());
    store.close().await;
}

#[tokio::test]
async fn tree_watch_delivers_one_full_listing_per_mutation() {
    let store = memory_store("").await.unwrap();
    for key in ["nodes/b", "nodes/a", "nodes/c"] {
        store.put(key, b"alive").await.unwrap();
    }
    let mut rx = store.watch_tree("nodes/", CancellationToken::new()).await.unwrap();

    let baseline = recv(&mut rx).await.unwrap();
    let keys: Vec<&str> = baseline.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["nodes/a", "nodes/b", "nodes/c"]);

    store.put("nodes/d", b"alive").await.unwrap();
    let listing = recv(&mut rx).await.unwrap();
    assert_eq!(listing.len(), 4);
    assert_quiet(&mut rx, Duration::from_millis(100)).await;

    store.delete("nodes/a").await.unwrap();
    let listing = recv(&mut rx).await.unwrap();
    assert_eq!(listing.len(), 3);
    assert!(listing.iter().all(|kv| kv.key != "nodes/a"));

    store.delete_tree("nodes/").await.unwrap();
    assert!(recv(&mut rx).await.unwrap().is_empty());

    store.close().await;
}

#[tokio::test]
async fn close_ends_active_subscriptions_promptly() {
    let store = memory_store("").await.unwrap();
    store.put("k", b"v").await.unwrap();
    store.put("t/a", b"v").await.unwrap();
    let mut key_rx = store.watch("k", CancellationToken::new()).await.unwrap();
    let mut tree_rx = store.watch_tree("t/", CancellationToken::new()).await.unwrap();
    assert!(recv(&mut key_rx).await.is_some());
    assert!(recv(&mut tree_rx).await.is_some());

    store.close().await;

    assert!(recv(&mut key_rx).await.is_none());
    assert!(recv(&mut tree_rx).await.is_none());
}

#[tokio::test]
async fn unread_subscription_does_not_block_close() {
    let store = KvStore::builder(kvstore::BackendKind::Memory)
        .lease_seconds(0)
        .watch_buffer_size(1)
        .close_grace(Duration::from_millis(500))
        .build()
        .await
        .unwrap();
    store.put("k", b"v0").await.unwrap();
    let _rx = store.watch("k", CancellationToken::new()).await.unwrap();

    for i in 1..5 {
        store.put("k", format!("v{i}").as_bytes()).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), store.close())
        .await
        .expect("close must not hang on a full watch channel");
}

#[tokio::test]
async fn namespaces_isolate_stores_sharing_a_backend() {
    let shared = MemoryBackend::new();
    let config = |namespace: &str| {
        StoreConfig::from_options(vec![
            StoreOption::Namespace(namespace.to_string()),
            StoreOption::LeaseSeconds(0),
        ])
    };
    let tenant_a = KvStore::with_backend(
        Arc::new(kvstore::NamespacedBackend::new(Arc::new(shared.clone()), "a/")),
        config("a/"),
    )
    .await
    .unwrap();
    let tenant_b = KvStore::with_backend(
        Arc::new(kvstore::NamespacedBackend::new(Arc::new(shared.clone()), "b/")),
        config("b/"),
    )
    .await
    .unwrap();

    tenant_a.put("config", b"from-a").await.unwrap();
    tenant_b.put("config", b"from-b").await.unwrap();

    assert_eq!(&tenant_a.get("config").await.unwrap().value[..], b"from-a");
    assert_eq!(&tenant_b.get("config").await.unwrap().value[..], b"from-b");

    tenant_a.delete("config").await.unwrap();
    assert!(tenant_b.exists("config").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn session_lease_keeps_keys_alive_and_removes_them_on_close() {
    let shared = MemoryBackend::new();
    let leased = KvStore::with_backend(
        Arc::new(shared.clone()),
        StoreConfig::from_options(vec![StoreOption::LeaseSeconds(1)]),
    )
    .await
    .unwrap();
    let observer = KvStore::with_backend(
        Arc::new(shared.clone()),
        StoreConfig::from_options(vec![StoreOption::LeaseSeconds(0)]),
    )
    .await
    .unwrap();
    assert!(leased.lease_id().is_some());

    leased.put("members/me", b"10.0.0.7").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(observer.exists("members/me").await.unwrap());

    let mut rx = observer.watch("members/me", CancellationToken::new()).await.unwrap();
    assert!(recv(&mut rx).await.is_some());

    leased.close().await;

    let gone = recv(&mut rx).await.unwrap();
    assert!(gone.is_deleted());
}
