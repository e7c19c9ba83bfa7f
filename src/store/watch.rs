//! Watch subscriptions
//!
//! One task per subscription owns the backend event stream and the sending
//! half of the outward channel. It waits on three sources: caller
//! cancellation, the store-wide stop signal and the backend stream. Sends
//! into a full channel block, but stay interruptible by both signals, so a
//! consumer that stops reading never pins the task.
//!
//! Lifecycle: `Starting -> Streaming -> Closing -> Closed`. `Starting`
//! happens in the caller (backend watch opened, baseline read); the task
//! starts in `Streaming` by delivering the baseline and drops the channel as
//! its final act.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::list_children;
use crate::metrics::ACTIVE_WATCHES;
use crate::metrics::WATCH_MESSAGES;
use crate::Backend;
use crate::BackendEvent;
use crate::EventStream;
use crate::KVPair;
use crate::Result;

pub(crate) const KEY_WATCH: &str = "key";
pub(crate) const TREE_WATCH: &str = "tree";

/// Everything one watch task owns
pub(crate) struct Subscription<T> {
    pub(crate) target: String,
    pub(crate) events: EventStream,
    pub(crate) tx: mpsc::Sender<T>,
    pub(crate) cancel: CancellationToken,
    pub(crate) stop: CancellationToken,
}

/// Keeps the active-watch gauge honest however the task exits
struct ActiveWatch(&'static str);

impl ActiveWatch {
    fn new(kind: &'static str) -> Self {
        ACTIVE_WATCHES.with_label_values(&[kind]).inc();
        Self(kind)
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        ACTIVE_WATCHES.with_label_values(&[self.0]).dec();
    }
}

/// Single-key watch: one message per backend event, deletes carry an empty value
pub(crate) async fn stream_key(
    subscription: Subscription<KVPair>,
    baseline: KVPair,
) {
    run(subscription, KEY_WATCH, vec![baseline], |batch| async move {
        let updates: Vec<KVPair> = batch.into_iter().map(|event| event.kv).collect();
        Ok(updates)
    })
    .await
}

/// Tree watch: every batch of events triggers one complete relisting
pub(crate) async fn stream_tree(
    subscription: Subscription<Vec<KVPair>>,
    baseline: Vec<KVPair>,
    backend: Arc<dyn Backend>,
) {
    let prefix = subscription.target.clone();
    run(subscription, TREE_WATCH, vec![baseline], move |_batch| {
        let backend = backend.clone();
        let prefix = prefix.clone();
        async move {
            match list_children(backend.as_ref(), &prefix).await {
                Ok(listing) => Ok(vec![listing]),
                Err(e) if e.is_not_found() => Ok(vec![Vec::new()]),
                Err(e) => Err(e),
            }
        }
    })
    .await
}

async fn run<T, F, Fut>(
    subscription: Subscription<T>,
    kind: &'static str,
    baseline: Vec<T>,
    mut translate: F,
) where
    T: Send,
    F: FnMut(Vec<BackendEvent>) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let Subscription {
        target,
        mut events,
        tx,
        cancel,
        stop,
    } = subscription;

    let _active = ActiveWatch::new(kind);
    info!(kind, target = %target, "Watch started");

    'streaming: {
        for message in baseline {
            if !deliver(&tx, message, kind, &cancel, &stop).await {
                break 'streaming;
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(kind, target = %target, "Watch canceled by caller");
                    break;
                }
                _ = stop.cancelled() => {
                    info!(kind, target = %target, "Store closed, ending watch");
                    break;
                }
                next = events.next() => next,
            };

            let batch = match next {
                Some(Ok(batch)) => batch,
                Some(Err(e)) if e.is_canceled() => {
                    info!(kind, target = %target, "Backend canceled watch: {}", e);
                    break;
                }
                Some(Err(e)) => {
                    error!(kind, target = %target, "Watch stream failed: {:?}", e);
                    break;
                }
                None => {
                    debug!(kind, target = %target, "Backend watch stream ended");
                    break;
                }
            };

            let translated = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = stop.cancelled() => break,
                translated = translate(batch) => translated,
            };

            let messages = match translated {
                Ok(messages) => messages,
                Err(e) => {
                    error!(kind, target = %target, "Watch refresh failed: {:?}", e);
                    break;
                }
            };

            for message in messages {
                if !deliver(&tx, message, kind, &cancel, &stop).await {
                    break 'streaming;
                }
            }
        }
    }

    drop(events);
    drop(tx);
    info!(kind, target = %target, "Watch stopped");
}

/// Blocking send that gives up when either signal fires or the receiver is gone
async fn deliver<T>(
    tx: &mpsc::Sender<T>,
    message: T,
    kind: &'static str,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> bool {
    let sent = tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = stop.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    };

    if sent {
        WATCH_MESSAGES.with_label_values(&[kind]).inc();
    }
    sent
}
