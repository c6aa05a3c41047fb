//! kide sync service (in-process).
//!
//! Ties per-kind API clients and stores together ([`ApiManager`]), keeps
//! stores live with watch subscriptions ([`KubeWatchApi`]) and owns one
//! connected cluster ([`ClusterContext`]).

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod manager;
pub mod watch;

pub use config::SyncConfig;
pub use context::ClusterContext;
pub use manager::ApiManager;
pub use watch::{KubeWatchApi, LoadFailureFn, SubscribeOptions, SubscriptionStatus, WatchSubscription};

pub use kide_core::{EventType, KubeObject, ResourceVersion, SyncError, SyncResult};
pub use kide_kubehub::{ApiResourceDef, KubeApi};
pub use kide_store::{KubeObjectStore, LoadError, NamespaceSelection, StoreChange};
