//! Registry of per-kind APIs and stores, addressable by path or kind name.

use std::sync::{Arc, RwLock};

use kide_core::{KubeObject, SyncError, SyncResult, Uid};
use kide_kubehub::{parse_api_path, KubeApi};
use kide_store::KubeObjectStore;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

#[derive(Default)]
struct Registry {
    /// By api base (`/apis/apps/v1/deployments`).
    apis: FxHashMap<String, Arc<KubeApi>>,
    stores: FxHashMap<String, Arc<KubeObjectStore>>,
    /// `apiVersion/Kind`, `Kind` and plural names to api base. First registration wins for short names.
    aliases: FxHashMap<String, String>,
}

#[derive(Default)]
pub struct ApiManager {
    inner: RwLock<Registry>,
}

impl std::fmt::Debug for ApiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = self.read();
        f.debug_struct("ApiManager").field("apis", &r.apis.len()).field("stores", &r.stores.len()).finish()
    }
}

impl ApiManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_api(&self, api: Arc<KubeApi>) -> SyncResult<()> {
        let base = api.api_base();
        let mut r = self.write();
        if r.apis.contains_key(&base) {
            return Err(SyncError::DuplicateRegistration(base));
        }
        let res = api.resource();
        r.aliases.insert(res.gvk_key(), base.clone());
        for short in [res.kind.clone(), res.plural.clone()] {
            r.aliases.entry(short).or_insert_with(|| base.clone());
        }
        debug!(kind = %res.kind, base = %base, "manager: api registered");
        r.apis.insert(base, api);
        Ok(())
    }

    /// Register a store; its API is registered too if it is not yet known.
    pub fn register_store(&self, store: Arc<KubeObjectStore>) -> SyncResult<()> {
        let base = store.resource().api_base();
        if self.read().stores.contains_key(&base) {
            return Err(SyncError::DuplicateRegistration(base));
        }
        if !self.read().apis.contains_key(&base) {
            self.register_api(store.api().clone())?;
        }
        let mut r = self.write();
        if r.stores.contains_key(&base) {
            return Err(SyncError::DuplicateRegistration(base));
        }
        r.stores.insert(base, store);
        Ok(())
    }

    /// Map an api base, collection or object path, `apiVersion/Kind`, `Kind` or plural to an api base.
    fn resolve(&self, key: &str) -> Option<String> {
        let r = self.read();
        if key.starts_with('/') {
            let base = parse_api_path(key)?.api_base;
            return r.apis.contains_key(&base).then_some(base);
        }
        r.aliases.get(key).cloned()
    }

    pub fn get_api(&self, key: &str) -> Option<Arc<KubeApi>> {
        let base = self.resolve(key)?;
        self.read().apis.get(&base).cloned()
    }

    pub fn get_store(&self, key: &str) -> Option<Arc<KubeObjectStore>> {
        let base = self.resolve(key)?;
        self.read().stores.get(&base).cloned()
    }

    /// Store holding the object at an object path, plus the object if loaded.
    pub fn lookup_path(&self, path: &str) -> Option<(Arc<KubeObjectStore>, Option<Arc<KubeObject>>)> {
        let store = self.get_store(path)?;
        let obj = store.get_by_path(path);
        Some((store, obj))
    }

    pub fn apis(&self) -> Vec<Arc<KubeApi>> {
        let mut out: Vec<_> = self.read().apis.values().cloned().collect();
        out.sort_by_key(|a| a.api_base());
        out
    }

    pub fn stores(&self) -> Vec<Arc<KubeObjectStore>> {
        let mut out: Vec<_> = self.read().stores.values().cloned().collect();
        out.sort_by_key(|s| s.resource().api_base());
        out
    }

    /// Owners of `obj` that are present in registered stores.
    ///
    /// Owners of unregistered kinds and owners not (yet) in their store are skipped.
    pub fn resolve_owners(&self, obj: &KubeObject) -> Vec<Arc<KubeObject>> {
        let mut out = Vec::new();
        for owner in obj.owner_references() {
            let key = format!("{}/{}", owner.api_version, owner.kind);
            let Some(store) = self.get_store(&key) else {
                debug!(owner_kind = %key, "manager: no store for owner kind");
                continue;
            };
            let found = Uid::from_meta(&owner.uid)
                .and_then(|uid| store.get_by_id(&uid))
                .or_else(|| store.get_by_name(&owner.name, obj.namespace()));
            match found {
                Some(o) => out.push(o),
                None => warn!(owner_kind = %key, owner = %owner.name, of = %obj.key(), "manager: owner not in store"),
            }
        }
        out
    }
}
