//! kide store: per-kind in-RAM mirror of cluster objects.
//!
//! One [`KubeObjectStore`] per kind. It is filled by [`KubeObjectStore::load_all`]
//! and kept live by [`KubeObjectStore::handle_watch_event`]; those are the only
//! writers. Readers get `Arc` snapshots of individual objects and a cached
//! namespace-filtered view ([`KubeObjectStore::context_items`]).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use futures::future::join_all;
use kide_core::{EventType, KubeObject, ObjectOrder, ResourceVersion, SyncError, SyncResult, Uid};
use kide_kubehub::{ApiResourceDef, KubeApi, ListOptions};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

mod selection;
mod tombstones;

pub use selection::{NamespaceSelection, Selected};
use tombstones::Tombstones;

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How many recent deletes are remembered to reject late duplicates.
    pub tombstone_capacity: usize,
    /// Selectors applied to every list.
    pub list: ListOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { tombstone_capacity: 1024, list: ListOptions::default() }
    }
}

/// A namespace (or the whole kind, `None`) that failed to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub namespace: Option<String>,
    pub error: SyncError,
}

/// What a `load_all` achieved.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    /// Per scope list version, the cursor to watch from.
    pub cursors: Vec<(Option<String>, ResourceVersion)>,
    pub errors: Vec<LoadError>,
}

/// Effect of one watch event on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Older than (or equal to) what the store already holds; ignored.
    Stale,
    /// Delete for a uid the store does not hold.
    Missing,
    /// Violates a store invariant; logged and ignored.
    Rejected(SyncError),
}

impl EventOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, EventOutcome::Inserted | EventOutcome::Replaced | EventOutcome::Removed)
    }
}

/// Change notification for observers.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Upserted(Arc<KubeObject>),
    Removed(Arc<KubeObject>),
    /// Content of these scopes was replaced wholesale (`None` = every namespace).
    Reloaded(Vec<Option<String>>),
    Evicted(String),
}

struct State {
    items: FxHashMap<Uid, Arc<KubeObject>>,
    paths: FxHashMap<String, Uid>,
    tombstones: Tombstones,
    load_errors: Vec<LoadError>,
    loaded: bool,
}

impl State {
    /// Drop a path entry only while it still points at `uid`; a recreated
    /// object under the same name may own it by now.
    fn unlink_path(&mut self, path: &str, uid: Uid) {
        if self.paths.get(path) == Some(&uid) {
            self.paths.remove(path);
        }
    }
}

struct ContextCache {
    revision: u64,
    selection_generation: u64,
    items: Arc<Vec<Arc<KubeObject>>>,
}

pub struct KubeObjectStore {
    api: Arc<KubeApi>,
    selection: NamespaceSelection,
    opts: StoreOptions,
    state: RwLock<State>,
    revision_tx: watch::Sender<u64>,
    changes_tx: broadcast::Sender<StoreChange>,
    generation: AtomicU64,
    context_cache: ArcSwapOption<ContextCache>,
}

impl std::fmt::Debug for KubeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectStore")
            .field("kind", &self.resource().kind)
            .field("items", &self.total_count())
            .field("revision", &self.revision())
            .finish()
    }
}

impl KubeObjectStore {
    pub fn new(api: Arc<KubeApi>, selection: NamespaceSelection, opts: StoreOptions) -> Self {
        let (revision_tx, _) = watch::channel(0u64);
        let (changes_tx, _) = broadcast::channel(1024);
        let state = State {
            items: FxHashMap::default(),
            paths: FxHashMap::default(),
            tombstones: Tombstones::with_capacity(opts.tombstone_capacity),
            load_errors: Vec::new(),
            loaded: false,
        };
        Self {
            api,
            selection,
            opts,
            state: RwLock::new(state),
            revision_tx,
            changes_tx,
            generation: AtomicU64::new(0),
            context_cache: ArcSwapOption::empty(),
        }
    }

    pub fn api(&self) -> &Arc<KubeApi> {
        &self.api
    }

    pub fn resource(&self) -> &ApiResourceDef {
        self.api.resource()
    }

    pub fn kind(&self) -> &str {
        &self.resource().kind
    }

    pub fn selection(&self) -> &NamespaceSelection {
        &self.selection
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    // ---- epoch guard ----

    /// Current subscription generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every in-flight load/event issued under an older generation.
    pub fn detach(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(kind = %self.kind(), generation = next, "store: detached");
        next
    }

    // ---- change notification ----

    /// Monotonic counter bumped on every visible change.
    pub fn revision(&self) -> u64 {
        *self.revision_tx.borrow()
    }

    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes_tx.subscribe()
    }

    fn bump(&self) {
        self.revision_tx.send_modify(|r| *r += 1);
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine.
        let _ = self.changes_tx.send(change);
    }

    // ---- writers ----

    /// List every requested namespace (all of them when empty or when the kind
    /// is cluster-scoped) and replace their content in one step.
    pub async fn load_all(&self, namespaces: &[String]) -> SyncResult<LoadSummary> {
        self.load_all_in(self.generation(), namespaces).await
    }

    /// [`Self::load_all`] bound to a generation; results of a stale generation are dropped.
    pub async fn load_all_in(&self, generation: u64, namespaces: &[String]) -> SyncResult<LoadSummary> {
        let t0 = Instant::now();
        let scopes: Vec<Option<String>> = if !self.resource().namespaced || namespaces.is_empty() {
            vec![None]
        } else {
            let mut ns: Vec<String> = namespaces.to_vec();
            ns.sort_unstable();
            ns.dedup();
            ns.into_iter().map(Some).collect()
        };
        let lists = join_all(scopes.iter().map(|s| self.api.list(s.as_deref(), &self.opts.list))).await;

        let mut summary = LoadSummary::default();
        {
            let mut st = self.write();
            if self.generation() != generation {
                debug!(kind = %self.kind(), "store: dropping list results of a stale generation");
                return Err(SyncError::Detached);
            }
            for (scope, res) in scopes.iter().zip(lists) {
                match res {
                    Ok(list) => {
                        Self::replace_scope(&mut st, self.resource(), scope.as_deref(), list.items);
                        match scope {
                            None => st.load_errors.clear(),
                            Some(_) => st.load_errors.retain(|e| &e.namespace != scope),
                        }
                        summary.cursors.push((scope.clone(), list.resource_version));
                    }
                    Err(error) => {
                        warn!(kind = %self.kind(), ns = %scope.as_deref().unwrap_or("(all)"), error = %error, "store: list failed");
                        counter!("kide_store_load_errors_total", 1, "kind" => self.kind().to_string(), "reason" => error.tag());
                        st.load_errors.retain(|e| &e.namespace != scope);
                        let e = LoadError { namespace: scope.clone(), error };
                        st.load_errors.push(e.clone());
                        summary.errors.push(e);
                    }
                }
            }
            if !summary.cursors.is_empty() {
                st.loaded = true;
            }
            self.bump();
        }

        if summary.cursors.is_empty() {
            // every scope failed; errors were recorded above
            let first = summary.errors.first().map(|e| e.error.clone()).unwrap_or(SyncError::Detached);
            return Err(first);
        }
        self.notify(StoreChange::Reloaded(summary.cursors.iter().map(|(s, _)| s.clone()).collect()));
        info!(
            kind = %self.kind(),
            scopes = summary.cursors.len(),
            failed = summary.errors.len(),
            items = self.total_count(),
            took_ms = %t0.elapsed().as_millis(),
            "store: load_all ok"
        );
        Ok(summary)
    }

    fn in_scope(obj: &KubeObject, scope: Option<&str>) -> bool {
        scope.map_or(true, |ns| obj.namespace() == Some(ns))
    }

    fn replace_scope(st: &mut State, resource: &ApiResourceDef, scope: Option<&str>, fresh: Vec<KubeObject>) {
        let stale: Vec<Uid> = st.items.values().filter(|o| Self::in_scope(o, scope)).map(|o| o.uid()).collect();
        for uid in stale {
            if let Some(old) = st.items.remove(&uid) {
                st.unlink_path(&resource.object_path(old.namespace(), old.name()), uid);
            }
        }
        for obj in fresh {
            if !Self::in_scope(&obj, scope) {
                warn!(kind = %resource.kind, key = %obj.key(), "store: list returned object outside requested namespace");
                continue;
            }
            let uid = obj.uid();
            st.tombstones.remove(&uid);
            st.paths.insert(resource.object_path(obj.namespace(), obj.name()), uid);
            if st.items.insert(uid, Arc::new(obj)).is_some() {
                warn!(kind = %resource.kind, uid = %uid, "store: duplicate uid in list response");
            }
        }
    }

    /// Apply one watch event. Updates replace the held object wholesale.
    pub fn handle_watch_event(&self, event: EventType, obj: KubeObject) -> EventOutcome {
        let mut st = self.write();
        self.apply_locked(&mut st, event, obj)
    }

    /// [`Self::handle_watch_event`] bound to a generation.
    pub fn handle_watch_event_in(&self, generation: u64, event: EventType, obj: KubeObject) -> SyncResult<EventOutcome> {
        let mut st = self.write();
        if self.generation() != generation {
            return Err(SyncError::Detached);
        }
        Ok(self.apply_locked(&mut st, event, obj))
    }

    fn apply_locked(&self, st: &mut State, event: EventType, obj: KubeObject) -> EventOutcome {
        let kind = self.kind().to_string();
        counter!("kide_store_events_total", 1, "kind" => kind.clone(), "event" => event.as_str());
        let uid = obj.uid();
        let rv = obj.resource_version().clone();
        let path = self.resource().object_path(obj.namespace(), obj.name());

        let outcome = match (event, st.items.get(&uid).cloned()) {
            (EventType::Add | EventType::Update, Some(held)) if rv.is_at_most(held.resource_version()) => EventOutcome::Stale,
            (EventType::Add, Some(held)) => {
                let err = SyncError::InconsistentState(format!(
                    "add for uid {} already held at rv {} (incoming rv {})",
                    uid,
                    held.resource_version(),
                    rv
                ));
                warn!(kind = %kind, uid = %uid, error = %err, "store: rejected add");
                counter!("kide_store_inconsistent_total", 1, "kind" => kind.clone());
                EventOutcome::Rejected(err)
            }
            (EventType::Update, Some(held)) => {
                st.unlink_path(&self.resource().object_path(held.namespace(), held.name()), uid);
                let obj = Arc::new(obj);
                st.paths.insert(path, uid);
                st.items.insert(uid, obj.clone());
                self.notify(StoreChange::Upserted(obj));
                EventOutcome::Replaced
            }
            (EventType::Add | EventType::Update, None) => {
                if st.tombstones.get(&uid).is_some_and(|dead| rv.is_at_most(dead)) {
                    EventOutcome::Stale
                } else {
                    st.tombstones.remove(&uid);
                    let obj = Arc::new(obj);
                    st.paths.insert(path, uid);
                    st.items.insert(uid, obj.clone());
                    self.notify(StoreChange::Upserted(obj));
                    EventOutcome::Inserted
                }
            }
            (EventType::Delete, Some(held)) if rv.is_older_than(held.resource_version()) => EventOutcome::Stale,
            (EventType::Delete, Some(held)) => {
                st.items.remove(&uid);
                st.unlink_path(&self.resource().object_path(held.namespace(), held.name()), uid);
                st.tombstones.insert(uid, rv.clone());
                self.notify(StoreChange::Removed(held));
                EventOutcome::Removed
            }
            (EventType::Delete, None) => {
                st.tombstones.insert(uid, rv.clone());
                EventOutcome::Missing
            }
        };

        if outcome.changed() {
            self.bump();
        } else if outcome == EventOutcome::Stale {
            counter!("kide_store_stale_events_total", 1, "kind" => kind.clone());
            debug!(kind = %kind, uid = %uid, rv = %rv, event = event.as_str(), "store: ignored stale event");
        }
        outcome
    }

    /// Drop every entry of a namespace, e.g. when it leaves the selection.
    pub fn evict_namespace(&self, namespace: &str) -> usize {
        let removed = {
            let mut st = self.write();
            let doomed: Vec<Arc<KubeObject>> =
                st.items.values().filter(|o| o.namespace() == Some(namespace)).cloned().collect();
            for o in &doomed {
                st.items.remove(&o.uid());
                st.unlink_path(&self.resource().object_path(o.namespace(), o.name()), o.uid());
            }
            st.load_errors.retain(|e| e.namespace.as_deref() != Some(namespace));
            if !doomed.is_empty() {
                self.bump();
            }
            doomed.len()
        };
        if removed > 0 {
            self.notify(StoreChange::Evicted(namespace.to_string()));
        }
        debug!(kind = %self.kind(), ns = %namespace, removed, "store: evicted namespace");
        removed
    }

    // ---- readers ----

    pub fn get_by_id(&self, uid: &Uid) -> Option<Arc<KubeObject>> {
        self.read().items.get(uid).cloned()
    }

    /// Lookup by API path (`/api/v1/namespaces/ns/pods/name`).
    pub fn get_by_path(&self, path: &str) -> Option<Arc<KubeObject>> {
        let st = self.read();
        let path = path.split('?').next().unwrap_or_default();
        st.paths.get(path).and_then(|uid| st.items.get(uid)).cloned()
    }

    pub fn get_by_name(&self, name: &str, namespace: Option<&str>) -> Option<Arc<KubeObject>> {
        let ns = if self.resource().namespaced { namespace } else { None };
        self.get_by_path(&self.resource().object_path(ns, name))
    }

    pub fn get_by_labels(&self, selector: &BTreeMap<String, String>) -> Vec<Arc<KubeObject>> {
        let mut out: Vec<_> = self.read().items.values().filter(|o| o.matches_labels(selector)).cloned().collect();
        out.sort_by(|a, b| ObjectOrder::Name.compare(a, b));
        out
    }

    /// Every held object, unordered.
    pub fn items(&self) -> Vec<Arc<KubeObject>> {
        self.read().items.values().cloned().collect()
    }

    pub fn sorted_items(&self, order: ObjectOrder) -> Vec<Arc<KubeObject>> {
        let mut out = self.items();
        out.sort_by(|a, b| order.compare(a, b));
        out
    }

    pub fn total_count(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.read().loaded
    }

    pub fn load_errors(&self) -> Vec<LoadError> {
        self.read().load_errors.clone()
    }

    pub fn tombstone_count(&self) -> usize {
        self.read().tombstones.len()
    }

    /// Tombstones dropped to stay within capacity since the store was created.
    pub fn tombstones_evicted(&self) -> u64 {
        self.read().tombstones.evicted()
    }

    /// Objects visible under the current namespace selection, sorted by name.
    ///
    /// Cached per (store revision, selection generation).
    pub fn context_items(&self) -> Arc<Vec<Arc<KubeObject>>> {
        let selection_generation = self.selection.generation();
        if let Some(c) = self.context_cache.load_full() {
            if c.revision == self.revision() && c.selection_generation == selection_generation {
                return c.items.clone();
            }
        }
        let selected = self.selection.current();
        let (revision, mut items) = {
            let st = self.read();
            let revision = self.revision();
            let items: Vec<Arc<KubeObject>> = st
                .items
                .values()
                .filter(|o| !self.resource().namespaced || o.namespace().map_or(true, |ns| selected.contains(ns)))
                .cloned()
                .collect();
            (revision, items)
        };
        items.sort_by(|a, b| ObjectOrder::Name.compare(a, b));
        let items = Arc::new(items);
        self.context_cache.store(Some(Arc::new(ContextCache {
            revision,
            selection_generation: selected.generation,
            items: items.clone(),
        })));
        items
    }
}
