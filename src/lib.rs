//! Backend-agnostic client for etcd-like coordination services.
//!
//! Application code depends on the small [`Store`] contract: put/get/delete,
//! prefix listing, single-key and subtree watches, and a session lease that
//! makes written keys ephemeral. [`KvStore`] implements it over any
//! [`Backend`]; [`EtcdBackend`] speaks etcd v3, [`MemoryBackend`] runs
//! in-process.
//!
//! ```no_run
//! use kvstore::{BackendKind, KvStore, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> kvstore::Result<()> {
//! let store = KvStore::builder(BackendKind::Memory).build().await?;
//! store.put("/config/limit", b"10").await?;
//!
//! let cancel = CancellationToken::new();
//! let mut updates = store.watch("config/limit", cancel.clone()).await?;
//! let current = updates.recv().await;
//! assert_eq!(current.map(|kv| kv.value), Some("10".into()));
//!
//! cancel.cancel();
//! store.close().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod config;
mod errors;
pub mod metrics;
mod store;

pub use backend::*;
pub use config::*;
pub use errors::*;
pub use store::*;
