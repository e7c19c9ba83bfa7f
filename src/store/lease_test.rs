use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::Span;
use tracing_test::traced_test;

use super::keepalive_interval;
use super::LeaseManager;
use crate::Backend;
use crate::Error;
use crate::LeaseError;
use crate::LeaseKeeper;
use crate::MockBackend;
use crate::MockLeaseKeeper;

const LEASE_ID: i64 = 42;

fn keeper_counting(
    renewals: Arc<AtomicUsize>,
    fail_after: usize,
) -> MockLeaseKeeper {
    let mut keeper = MockLeaseKeeper::new();
    keeper.expect_lease_id().return_const(LEASE_ID);
    keeper.expect_renew().returning(move || {
        let n = renewals.fetch_add(1, Ordering::SeqCst) + 1;
        if n > fail_after {
            Err(LeaseError::KeepAlive {
                lease_id: LEASE_ID,
                reason: "lease expired or revoked".into(),
            }
            .into())
        } else {
            Ok(3)
        }
    });
    keeper
}

fn backend_with_keeper(keeper: MockLeaseKeeper) -> MockBackend {
    let mut backend = MockBackend::new();
    backend.expect_grant().returning(|_| Ok(LEASE_ID));
    backend
        .expect_keep_alive()
        .return_once(move |_| Ok(Box::new(keeper) as Box<dyn LeaseKeeper>));
    backend
}

#[test]
fn test_keepalive_interval_is_a_third_of_ttl() {
    assert_eq!(keepalive_interval(3), Duration::from_secs(1));
    assert_eq!(keepalive_interval(30), Duration::from_secs(10));
    assert_eq!(keepalive_interval(0), Duration::from_millis(100));
    assert_eq!(keepalive_interval(i64::MAX), Duration::from_millis(u64::MAX / 3));
}

#[tokio::test]
async fn test_acquire_is_noop_without_ttl() {
    // any backend call would panic
    let backend: Arc<dyn Backend> = Arc::new(MockBackend::new());

    let lease = LeaseManager::acquire(&backend, 0, &Span::none()).await.unwrap();
    assert!(lease.is_none());

    let lease = LeaseManager::acquire(&backend, -1, &Span::none()).await.unwrap();
    assert!(lease.is_none());
}

#[tokio::test]
async fn test_grant_failure_is_lease_error() {
    let mut backend = MockBackend::new();
    backend
        .expect_grant()
        .times(1)
        .returning(|_| Err(Error::backend("grant", "etcdserver: too many requests")));
    let backend: Arc<dyn Backend> = Arc::new(backend);

    let result = LeaseManager::acquire(&backend, 5, &Span::none()).await;

    assert!(matches!(result, Err(Error::Lease(LeaseError::Grant { ttl: 5, .. }))));
}

#[tokio::test]
#[traced_test]
async fn test_first_keepalive_failure_revokes_lease() {
    let renewals = Arc::new(AtomicUsize::new(0));
    let mut backend = backend_with_keeper(keeper_counting(renewals.clone(), 0));
    backend
        .expect_revoke()
        .withf(|id| *id == LEASE_ID)
        .times(1)
        .returning(|_| Ok(()));
    let backend: Arc<dyn Backend> = Arc::new(backend);

    let result = LeaseManager::acquire(&backend, 3, &Span::current()).await;

    assert!(matches!(result, Err(Error::Lease(LeaseError::KeepAlive { .. }))));
    assert_eq!(renewals.load(Ordering::SeqCst), 1);
    assert!(logs_contain("First lease keepalive failed"));
}

#[tokio::test]
async fn test_keep_alive_open_failure_is_lease_error() {
    let mut backend = MockBackend::new();
    backend.expect_grant().returning(|_| Ok(LEASE_ID));
    backend
        .expect_keep_alive()
        .returning(|_| Err(Error::backend("keep_alive", "stream refused")));
    backend.expect_revoke().times(1).returning(|_| Ok(()));
    let backend: Arc<dyn Backend> = Arc::new(backend);

    let result = LeaseManager::acquire(&backend, 3, &Span::none()).await;

    match result {
        Err(Error::Lease(LeaseError::KeepAlive { lease_id, reason })) => {
            assert_eq!(lease_id, LEASE_ID);
            assert!(reason.contains("stream refused"));
        }
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("acquire should fail"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_loop_renews_until_released() {
    let renewals = Arc::new(AtomicUsize::new(0));
    let mut backend = backend_with_keeper(keeper_counting(renewals.clone(), usize::MAX));
    backend.expect_revoke().times(1).returning(|_| Ok(()));
    let backend: Arc<dyn Backend> = Arc::new(backend);

    let mut lease = LeaseManager::acquire(&backend, 3, &Span::none())
        .await
        .unwrap()
        .expect("lease enabled");
    assert_eq!(lease.lease_id(), Some(LEASE_ID));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(renewals.load(Ordering::SeqCst) >= 4);

    lease.release(&backend).await;
    let after_release = renewals.load(Ordering::SeqCst);
    assert_eq!(lease.lease_id(), None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(renewals.load(Ordering::SeqCst), after_release);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_keepalive_failure_clears_lease_id() {
    let renewals = Arc::new(AtomicUsize::new(0));
    let backend: Arc<dyn Backend> = Arc::new(backend_with_keeper(keeper_counting(renewals.clone(), 1)));

    let lease = LeaseManager::acquire(&backend, 3, &Span::current())
        .await
        .unwrap()
        .expect("lease enabled");
    assert_eq!(lease.lease_id(), Some(LEASE_ID));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(lease.lease_id(), None);
    assert!(logs_contain("Lease keepalive failed"));
}

#[tokio::test]
#[traced_test]
async fn test_release_swallows_revoke_failure() {
    let renewals = Arc::new(AtomicUsize::new(0));
    let mut backend = backend_with_keeper(keeper_counting(renewals, usize::MAX));
    backend
        .expect_revoke()
        .times(1)
        .returning(|_| Err(Error::backend("revoke", "lease not found")));
    let backend: Arc<dyn Backend> = Arc::new(backend);

    let mut lease = LeaseManager::acquire(&backend, 3, &Span::current())
        .await
        .unwrap()
        .expect("lease enabled");
    lease.release(&backend).await;

    assert!(logs_contain("Failed to revoke lease"));
}
