use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use super::etcd::connect_options;
use super::etcd::is_unreachable;
use super::etcd::map_error;
use super::etcd::until_closed;
use super::EtcdBackend;
use crate::BackendEvent;
use crate::CustomBackendSet;
use crate::Error;
use crate::EventKind;
use crate::KVPair;
use crate::StoreConfig;
use crate::StoreOption;

#[test]
fn test_connect_options_runs_custom_hook() {
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let config = StoreConfig::from_options(vec![
        StoreOption::Username("root".into()),
        StoreOption::Password("secret".into()),
        StoreOption::CustomBackendSet(CustomBackendSet::new(move |options| {
            flag.store(true, Ordering::SeqCst);
            options.with_keep_alive(Duration::from_secs(10), Duration::from_secs(3))
        })),
    ]);

    let _ = connect_options(&config);

    assert!(called.load(Ordering::SeqCst));
}

#[test]
fn test_transport_level_statuses_are_unreachable() {
    for status in [
        Status::unavailable("no leader"),
        Status::deadline_exceeded("timeout"),
        Status::cancelled("conn closed"),
    ] {
        assert!(is_unreachable(&etcd_client::Error::GRpcStatus(status)));
    }

    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    assert!(is_unreachable(&etcd_client::Error::IoError(io)));
}

#[test]
fn test_server_answers_are_not_unreachable() {
    assert!(!is_unreachable(&etcd_client::Error::GRpcStatus(
        Status::permission_denied("auth")
    )));
    assert!(!is_unreachable(&etcd_client::Error::GRpcStatus(Status::not_found("x"))));
    assert!(!is_unreachable(&etcd_client::Error::InvalidArgs("bad".into())));
}

#[test]
fn test_map_error_wraps_as_backend_error() {
    let err = map_error("put", etcd_client::Error::GRpcStatus(Status::permission_denied("auth")));

    match err {
        Error::Backend { operation, .. } => assert_eq!(operation, "put"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_to_dead_endpoint_is_not_reachable() {
    let config = StoreConfig::from_options(vec![
        StoreOption::Endpoints(vec!["127.0.0.1:1".into()]),
        StoreOption::DialTimeout(Duration::from_millis(200)),
    ]);

    let result = tokio::time::timeout(Duration::from_secs(5), EtcdBackend::connect(&config))
        .await
        .expect("connect must honour the dial timeout");

    assert!(matches!(result, Err(Error::NotReachable { .. })));
}

#[tokio::test]
async fn test_event_streams_end_when_backend_closes() {
    let (tx, rx) = mpsc::channel(4);
    let closed = CancellationToken::new();
    let mut events = until_closed(ReceiverStream::new(rx), &closed);

    let event = BackendEvent {
        kind: EventKind::Put,
        kv: KVPair::new("k", "v1", 3),
    };
    tx.send(Ok(vec![event.clone()])).await.unwrap();
    assert_eq!(events.next().await.unwrap().unwrap(), vec![event.clone()]);

    closed.cancel();
    // the server side is still open and still sending
    tx.send(Ok(vec![event])).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("stream ended promptly");
    assert!(next.is_none());
    assert!(!tx.is_closed());
}
