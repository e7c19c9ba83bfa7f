use std::time::Duration;

use etcd_client::ConnectOptions;
use tracing::Span;

use super::KvStore;
use crate::BackendKind;
use crate::CustomBackendSet;
use crate::Result;
use crate::StoreConfig;
use crate::StoreOption;

/// Configurable builder for [`KvStore`] sessions
///
/// # Typical Usage Flow
/// 1. Create with [`KvStore::builder`]
/// 2. Chain configuration methods or [`option`](StoreBuilder::option)s
/// 3. Finalize with `.build().await`
///
/// # Default Configuration
/// - Endpoints: `127.0.0.1:2379`
/// - Dial Timeout: 5s
/// - Lease TTL: 5s
/// - Namespace: none
pub struct StoreBuilder {
    kind: BackendKind,
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            config: StoreConfig::default(),
        }
    }

    pub fn endpoints(
        mut self,
        endpoints: Vec<String>,
    ) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    pub fn username(
        mut self,
        username: impl Into<String>,
    ) -> Self {
        self.config.username = Some(username.into());
        self
    }

    pub fn password(
        mut self,
        password: impl Into<String>,
    ) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set connect timeout (default: 5s)
    pub fn dial_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.apply(StoreOption::DialTimeout(timeout));
        self
    }

    /// Adjust etcd connect options after every other setting was applied
    pub fn custom_backend_set(
        mut self,
        hook: impl Fn(ConnectOptions) -> ConnectOptions + Send + Sync + 'static,
    ) -> Self {
        self.config.custom_backend_set = Some(CustomBackendSet::new(hook));
        self
    }

    /// Prefix transparently applied to every key
    pub fn namespace(
        mut self,
        namespace: impl Into<String>,
    ) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Session lease TTL in seconds, `<= 0` disables leasing (default: 5)
    pub fn lease_seconds(
        mut self,
        ttl: i64,
    ) -> Self {
        self.config.lease_seconds = ttl;
        self
    }

    pub fn logger(
        mut self,
        span: Span,
    ) -> Self {
        self.config.logger = Some(span);
        self
    }

    /// Capacity of every outward watch channel (default: 16)
    pub fn watch_buffer_size(
        mut self,
        size: usize,
    ) -> Self {
        self.config.watch_buffer_size = size;
        self
    }

    /// How long `close` waits for watch tasks (default: 1s)
    pub fn close_grace(
        mut self,
        grace: Duration,
    ) -> Self {
        self.config.apply(StoreOption::CloseGrace(grace));
        self
    }

    /// Apply one option; later settings overwrite earlier ones
    pub fn option(
        mut self,
        option: StoreOption,
    ) -> Self {
        self.config.apply(option);
        self
    }

    /// Completely replaces the configuration
    ///
    /// Discards everything set through the individual methods so far.
    pub fn set_config(
        mut self,
        config: StoreConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and open the session
    pub async fn build(self) -> Result<KvStore> {
        KvStore::open(self.kind, self.config).await
    }
}
