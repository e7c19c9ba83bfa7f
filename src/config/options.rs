use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::ConnectOptions;
use tracing::Span;

/// Escape hatch for backend-specific connect settings
///
/// Runs last, after endpoints, credentials and dial timeout were applied, so
/// it sees (and may override) the options derived from [`super::StoreConfig`].
#[derive(Clone)]
pub struct CustomBackendSet(Arc<dyn Fn(ConnectOptions) -> ConnectOptions + Send + Sync>);

impl CustomBackendSet {
    pub fn new(hook: impl Fn(ConnectOptions) -> ConnectOptions + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub fn apply(
        &self,
        options: ConnectOptions,
    ) -> ConnectOptions {
        (self.0)(options)
    }
}

impl fmt::Debug for CustomBackendSet {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("CustomBackendSet(..)")
    }
}

/// The closed set of construction options
///
/// Applied in order by [`super::StoreConfig::from_options`]; unset options
/// keep their documented defaults.
#[derive(Debug, Clone)]
pub enum StoreOption {
    Endpoints(Vec<String>),
    Username(String),
    Password(String),
    DialTimeout(Duration),
    CustomBackendSet(CustomBackendSet),
    Namespace(String),
    LeaseSeconds(i64),
    Logger(Span),
    WatchBufferSize(usize),
    CloseGrace(Duration),
}
