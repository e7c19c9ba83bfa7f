use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;


lazy_static! {
    pub static ref STORE_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("kvstore_operations_total", "Store operations by outcome"),
        &["op", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref STORE_OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "kvstore_operation_duration_ms",
            "Histogram of store operation latency in ms"
        )
        .buckets(exponential_buckets(0.25, 2.0, 14).expect("valid buckets")),
        &["op"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_WATCHES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("kvstore_active_watches", "Watch subscriptions currently streaming"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("kvstore_watch_messages_total", "Messages delivered to watch subscribers"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry
            .register(Box::new(STORE_OPERATIONS.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(STORE_OPERATION_DURATION.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(ACTIVE_WATCHES.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(WATCH_MESSAGES.clone()))
            .expect("collector can be registered");
        registry
    };
}

/// Records latency of one store operation when dropped
pub(crate) struct OpTimer {
    op: &'static str,
    start: Instant,
}

impl OpTimer {
    pub(crate) fn new(op: &'static str) -> Self {
        Self {
            op,
            start: Instant::now(),
        }
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        STORE_OPERATION_DURATION.with_label_values(&[self.op]).observe(elapsed);
    }
}

/// Count an operation result; expected not-found outcomes are kept apart from failures
pub(crate) fn record_outcome<T>(
    op: &'static str,
    result: &crate::Result<T>,
) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) if e.is_not_found() => "not_found",
        Err(_) => "error",
    };
    STORE_OPERATIONS.with_label_values(&[op, outcome]).inc();
}
