//! One connected cluster: transport, registered kinds, stores and subscriptions.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use kide_core::kinds::DecodeFn;
use kide_core::{KindRegistry, KubeObject, SyncError, SyncResult, TypedObject};
use kide_kubehub::{builtin_resources, discover_resources, ApiResourceDef, KubeApi, KubeClientTransport, Transport};
use kide_store::{KubeObjectStore, NamespaceSelection};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::manager::ApiManager;
use crate::watch::{KubeWatchApi, SubscribeOptions, WatchSubscription};

pub struct ClusterContext {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    manager: ApiManager,
    selection: NamespaceSelection,
    kinds: RwLock<KindRegistry>,
    watch: KubeWatchApi,
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .field("selection", &self.selection)
            .finish()
    }
}

impl ClusterContext {
    /// Context over an existing transport with every built-in kind registered.
    pub fn init(config: SyncConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        let ctx = Self {
            selection: NamespaceSelection::with(config.namespaces.iter().cloned()),
            watch: KubeWatchApi::new(config.backoff(), config.watch()),
            manager: ApiManager::new(),
            kinds: RwLock::new(KindRegistry::builtin()),
            transport,
            config,
        };
        for def in builtin_resources() {
            ctx.register_resource(def)?;
        }
        Ok(ctx)
    }

    /// Connect with the ambient kubeconfig and register discovered kinds (CRDs included).
    /// Discovery failures are logged; built-in kinds stay usable.
    pub async fn connect(config: SyncConfig) -> anyhow::Result<Self> {
        let transport = KubeClientTransport::try_default().await?;
        let client = transport.client().clone();
        let ctx = Self::init(config, Arc::new(transport))?;
        match discover_resources(client).await {
            Ok(defs) => {
                let mut added = 0usize;
                for def in defs {
                    if ctx.manager.get_api(&def.api_base()).is_some() {
                        continue;
                    }
                    match ctx.register_resource(def) {
                        Ok(_) => added += 1,
                        Err(e) => warn!(error = %e, "context: skipping discovered resource"),
                    }
                }
                info!(added, "context: discovered kinds registered");
            }
            Err(e) => warn!(error = %e, "context: discovery failed; using built-in kinds only"),
        }
        Ok(ctx)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn manager(&self) -> &ApiManager {
        &self.manager
    }

    pub fn selection(&self) -> &NamespaceSelection {
        &self.selection
    }

    pub fn watch_api(&self) -> &KubeWatchApi {
        &self.watch
    }

    /// Register a kind: API client plus store. Registering the same api base twice fails.
    pub fn register_resource(&self, def: ApiResourceDef) -> SyncResult<Arc<KubeObjectStore>> {
        let api = Arc::new(KubeApi::new(def, self.transport.clone(), self.config.retry()));
        let store = Arc::new(KubeObjectStore::new(api, self.selection.clone(), self.config.store()));
        self.manager.register_store(store.clone())?;
        Ok(store)
    }

    /// Typed decoder for a custom kind.
    pub fn register_kind(&self, kind: &str, decode: DecodeFn) -> SyncResult<()> {
        self.kinds.write().unwrap_or_else(|p| p.into_inner()).register(kind, decode)
    }

    pub fn decode(&self, obj: &KubeObject) -> SyncResult<TypedObject> {
        self.kinds.read().unwrap_or_else(|p| p.into_inner()).decode(obj)
    }

    pub fn api(&self, key: &str) -> SyncResult<Arc<KubeApi>> {
        self.manager.get_api(key).ok_or_else(|| SyncError::NotFound(format!("kind {}", key)))
    }

    /// Store by api base, path, `apiVersion/Kind`, `Kind` or plural.
    pub fn store(&self, key: &str) -> SyncResult<Arc<KubeObjectStore>> {
        self.manager.get_store(key).ok_or_else(|| SyncError::NotFound(format!("kind {}", key)))
    }

    pub fn subscribe(&self, key: &str, opts: SubscribeOptions) -> SyncResult<WatchSubscription> {
        let store = self.store(key)?;
        Ok(self.watch.subscribe(store, opts))
    }

    /// Change the namespace selection. Subscriptions that follow it are
    /// restarted and entries of namespaces that left the selection are evicted.
    pub fn select_namespaces<I, S>(&self, namespaces: I) -> Vec<WatchSubscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection.set(namespaces);
        let selected = self.selection.current();
        let mut restarted = Vec::new();
        for sub in self.watch.subscriptions().into_iter().filter(|s| s.follows_selection()) {
            let opts = sub.options();
            sub.unsubscribe();
            let store = sub.store().clone();
            if !selected.is_all() && store.resource().namespaced {
                let gone: BTreeSet<String> = store
                    .items()
                    .iter()
                    .filter_map(|o| o.namespace())
                    .filter(|ns| !selected.contains(ns))
                    .map(str::to_string)
                    .collect();
                for ns in gone {
                    store.evict_namespace(&ns);
                }
            }
            restarted.push(self.watch.subscribe(store, opts));
        }
        info!(namespaces = ?selected.namespaces, restarted = restarted.len(), "context: namespace selection changed");
        restarted
    }

    /// Close every subscription and wait for their tasks.
    pub async fn shutdown(&self) {
        let subs = self.watch.unsubscribe_all();
        let n = subs.len();
        for s in subs {
            s.closed().await;
        }
        info!(subscriptions = n, "context: shut down");
    }
}
