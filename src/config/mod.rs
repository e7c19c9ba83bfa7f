//! Configuration management for store sessions.
//!
//! Settings are loaded from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Optional TOML file
//! 3. Environment variables prefixed with `KVSTORE__` (highest priority)
//!
//! A [`StoreConfig`] is an immutable snapshot once a store has been opened;
//! mutating a copy afterwards has no effect on the live session.

mod options;
pub use options::*;


use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use tracing::Span;

use crate::BackendKind;
use crate::MAX_LEASE_TTL;
use crate::Error;
use crate::Result;

/// Top level settings: which backend to talk to and how
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendKind,

    /// Session parameters
    #[serde(default)]
    pub store: StoreConfig,
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment
    ///
    /// # Arguments
    /// * `path` - Optional path to a TOML file overriding defaults
    ///
    /// # Environment
    /// `KVSTORE__STORE__LEASE_SECONDS=10`, `KVSTORE__BACKEND=memory`,
    /// `KVSTORE__STORE__ENDPOINTS=10.0.0.1:2379,10.0.0.2:2379`
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("KVSTORE")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("store.endpoints"),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.store.validate()?;
        Ok(settings)
    }
}

/// Session configuration for one store
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Backend endpoints, `host:port` or full URLs
    /// Default: ["127.0.0.1:2379"]
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Authentication user, only used together with `password`
    #[serde(default)]
    pub username: Option<String>,

    /// Authentication password, only used together with `username`
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum time to wait for the backend connection
    /// Default: 5000ms
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Key prefix transparently applied to every operation
    /// Default: "" (no namespace)
    #[serde(default)]
    pub namespace: String,

    /// Session lease TTL in seconds, `<= 0` disables leasing
    /// Default: 5
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,

    /// Capacity of every outward watch channel
    /// Default: 16
    #[serde(default = "default_watch_buffer_size")]
    pub watch_buffer_size: usize,

    /// How long `close` waits for watch tasks to drain
    /// Default: 1000ms
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// Backend-specific connect option hook
    #[serde(skip)]
    pub custom_backend_set: Option<CustomBackendSet>,

    /// Span every operation and background task is recorded under
    #[serde(skip)]
    pub logger: Option<Span>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            username: None,
            password: None,
            dial_timeout_ms: default_dial_timeout_ms(),
            namespace: String::new(),
            lease_seconds: default_lease_seconds(),
            watch_buffer_size: default_watch_buffer_size(),
            close_grace_ms: default_close_grace_ms(),
            custom_backend_set: None,
            logger: None,
        }
    }
}

impl StoreConfig {
    /// Build a config by applying `options` in order over the defaults
    pub fn from_options(options: impl IntoIterator<Item = StoreOption>) -> Self {
        let mut config = Self::default();
        for option in options {
            config.apply(option);
        }
        config
    }

    /// Apply a single option, later options overwrite earlier ones
    pub fn apply(
        &mut self,
        option: StoreOption,
    ) {
        match option {
            StoreOption::Endpoints(endpoints) => self.endpoints = endpoints,
            StoreOption::Username(username) => self.username = Some(username),
            StoreOption::Password(password) => self.password = Some(password),
            StoreOption::DialTimeout(timeout) => {
                self.dial_timeout_ms = timeout.as_millis() as u64
            }
            StoreOption::CustomBackendSet(hook) => self.custom_backend_set = Some(hook),
            StoreOption::Namespace(namespace) => self.namespace = namespace,
            StoreOption::LeaseSeconds(ttl) => self.lease_seconds = ttl,
            StoreOption::Logger(span) => self.logger = Some(span),
            StoreOption::WatchBufferSize(size) => self.watch_buffer_size = size,
            StoreOption::CloseGrace(grace) => self.close_grace_ms = grace.as_millis() as u64,
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Credentials, present only when both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::Config(ConfigError::Message(
                "at least one non-empty endpoint is required".to_string(),
            )));
        }

        if self.lease_seconds > MAX_LEASE_TTL {
            return Err(Error::Config(ConfigError::Message(format!(
                "lease_seconds must not exceed {MAX_LEASE_TTL}"
            ))));
        }

        if self.watch_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch_buffer_size must be greater than 0".to_string(),
            )));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Config(ConfigError::Message(
                "username and password must be configured together".to_string(),
            )));
        }

        Ok(())
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_lease_seconds() -> i64 {
    5
}
fn default_watch_buffer_size() -> usize {
    16
}
fn default_close_grace_ms() -> u64 {
    1000
}
