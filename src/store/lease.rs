//! Session lease: grant, background keepalive and revoke-on-close.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use tracing::Instrument;
use tracing::Span;

use crate::Backend;
use crate::Error;
use crate::LeaseError;
use crate::LeaseId;
use crate::LeaseKeeper;
use crate::Result;

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Renewal period for a lease of `ttl` seconds
pub(crate) fn keepalive_interval(ttl: i64) -> Duration {
    let period = Duration::from_millis((ttl.max(0) as u64).saturating_mul(1000) / 3);
    period.max(MIN_KEEPALIVE_INTERVAL)
}

/// Owns one granted lease and its keepalive task
pub(crate) struct LeaseManager {
    lease_id: LeaseId,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LeaseManager {
    /// Grant a lease of `ttl` seconds and keep it alive in the background
    ///
    /// Returns `Ok(None)` when `ttl <= 0`. Only returns once one keepalive
    /// round-trip succeeded; if that fails the lease is revoked again.
    pub(crate) async fn acquire(
        backend: &Arc<dyn Backend>,
        ttl: i64,
        span: &Span,
    ) -> Result<Option<Self>> {
        if ttl <= 0 {
            debug!(ttl, "Leasing disabled");
            return Ok(None);
        }

        let lease_id = backend.grant(ttl).await.map_err(|e| LeaseError::Grant {
            ttl,
            source: e.into(),
        })?;

        let first_renewal = async {
            let mut keeper = backend.keep_alive(lease_id).await?;
            keeper.renew().await?;
            Ok::<_, Error>(keeper)
        }
        .await;

        let keeper = match first_renewal {
            Ok(keeper) => keeper,
            Err(e) => {
                error!(lease_id, "First lease keepalive failed: {:?}", e);
                if let Err(revoke_err) = backend.revoke(lease_id).await {
                    warn!(lease_id, "Failed to revoke lease after keepalive failure: {:?}", revoke_err);
                }
                return Err(match e {
                    Error::Lease(_) => e,
                    other => LeaseError::KeepAlive {
                        lease_id,
                        reason: other.to_string(),
                    }
                    .into(),
                });
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            keepalive_loop(keeper, keepalive_interval(ttl), alive.clone(), cancel.clone())
                .instrument(span.clone()),
        );

        info!(lease_id, ttl, "Session lease acquired");
        Ok(Some(Self {
            lease_id,
            alive,
            cancel,
            handle: Some(handle),
        }))
    }

    /// The lease id while keepalive is healthy
    pub(crate) fn lease_id(&self) -> Option<LeaseId> {
        self.alive.load(Ordering::Acquire).then_some(self.lease_id)
    }

    /// Stop the keepalive loop and revoke the lease
    ///
    /// Revocation failures are logged and swallowed.
    pub(crate) async fn release(
        &mut self,
        backend: &Arc<dyn Backend>,
    ) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(lease_id = self.lease_id, "Lease keepalive task ended abnormally: {:?}", e);
            }
        }
        self.alive.store(false, Ordering::Release);

        match backend.revoke(self.lease_id).await {
            Ok(()) => info!(lease_id = self.lease_id, "Session lease revoked"),
            Err(e) => warn!(lease_id = self.lease_id, "Failed to revoke lease: {:?}", e),
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn keepalive_loop(
    mut keeper: Box<dyn LeaseKeeper>,
    period: Duration,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let lease_id = keeper.lease_id();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and acquire already renewed once
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let renewed = tokio::select! {
            _ = cancel.cancelled() => break,
            renewed = keeper.renew() => renewed,
        };

        match renewed {
            Ok(ttl) => trace!(lease_id, ttl, "Lease renewed"),
            Err(e) => {
                error!(lease_id, "Lease keepalive failed: {:?}", e);
                alive.store(false, Ordering::Release);
                return;
            }
        }
    }

    debug!(lease_id, "Lease keepalive stopped");
}
