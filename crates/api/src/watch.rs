//! Watch subscriptions: keep a store in sync with the cluster.
//!
//! A subscription lists its namespaces, then runs one watch worker per
//! namespace scope until it is closed. Workers reconnect from their cursor
//! when the server ends a stream, back off after errors, and relist their
//! scope when the cursor expires (HTTP 410).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use futures::StreamExt;
use kide_core::{EventType, ResourceVersion, SyncError, SyncResult};
use kide_kubehub::{Backoff, BackoffPolicy, WatchItem, WatchOptions};
use kide_store::{KubeObjectStore, LoadError, LoadSummary};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observable lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    Idle,
    Connecting,
    Active,
    Errored,
    Backoff,
    Closed,
}

impl SubscriptionStatus {
    /// Higher wins when folding per-scope states into one.
    fn severity(self) -> u8 {
        match self {
            SubscriptionStatus::Idle => 0,
            SubscriptionStatus::Active => 1,
            SubscriptionStatus::Connecting => 2,
            SubscriptionStatus::Backoff => 3,
            SubscriptionStatus::Errored => 4,
            SubscriptionStatus::Closed => 5,
        }
    }
}

pub type LoadFailureFn = Arc<dyn Fn(&LoadError) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Namespaces to watch. `None` follows the store's namespace selection.
    pub namespaces: Option<Vec<String>>,
    /// Called for every failed list, including single failed namespaces.
    pub on_load_failure: Option<LoadFailureFn>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("namespaces", &self.namespaces)
            .field("on_load_failure", &self.on_load_failure.is_some())
            .finish()
    }
}

/// Per-scope states folded into the subscription status.
struct StatusBoard {
    tx: watch::Sender<SubscriptionStatus>,
    scopes: Mutex<Vec<SubscriptionStatus>>,
}

impl StatusBoard {
    fn new() -> Self {
        let (tx, _) = watch::channel(SubscriptionStatus::Idle);
        Self { tx, scopes: Mutex::new(Vec::new()) }
    }

    fn publish(&self, status: SubscriptionStatus) {
        self.tx.send_if_modified(|cur| {
            if *cur == SubscriptionStatus::Closed || *cur == status {
                return false;
            }
            *cur = status;
            true
        });
    }

    fn set_all(&self, status: SubscriptionStatus) {
        self.scopes.lock().unwrap_or_else(|p| p.into_inner()).iter_mut().for_each(|s| *s = status);
        self.publish(status);
    }

    fn reset(&self, count: usize, status: SubscriptionStatus) {
        *self.scopes.lock().unwrap_or_else(|p| p.into_inner()) = vec![status; count];
        self.publish(status);
    }

    fn set(&self, scope: usize, status: SubscriptionStatus) {
        let folded = {
            let mut scopes = self.scopes.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(s) = scopes.get_mut(scope) {
                *s = status;
            }
            scopes.iter().copied().max_by_key(|s| s.severity()).unwrap_or(status)
        };
        self.publish(folded);
    }

    fn close(&self) {
        self.tx.send_replace(SubscriptionStatus::Closed);
    }
}

struct Shared {
    store: Arc<KubeObjectStore>,
    generation: u64,
    follows_selection: bool,
    on_load_failure: Option<LoadFailureFn>,
    board: StatusBoard,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running subscription. Clones share the same subscription.
#[derive(Clone)]
pub struct WatchSubscription {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("kind", &self.shared.store.kind())
            .field("generation", &self.shared.generation)
            .field("status", &self.status())
            .finish()
    }
}

impl WatchSubscription {
    pub fn store(&self) -> &Arc<KubeObjectStore> {
        &self.shared.store
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.shared.board.tx.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<SubscriptionStatus> {
        self.shared.board.tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the namespaces come from the store's selection.
    pub fn follows_selection(&self) -> bool {
        self.shared.follows_selection
    }

    /// Options that restart this subscription on the current namespace selection.
    pub fn options(&self) -> SubscribeOptions {
        SubscribeOptions {
            namespaces: None,
            on_load_failure: self.shared.on_load_failure.clone(),
        }
    }

    /// Stop watching. Safe to call any number of times; returns `true` for the call that closed it.
    pub fn unsubscribe(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.cancel.cancel();
        self.shared.store.detach();
        self.shared.board.close();
        info!(kind = %self.shared.store.kind(), "watch: unsubscribed");
        true
    }

    /// Wait for the background task to finish. Returns at once if it already did.
    pub async fn closed(&self) {
        let handle = self.shared.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                warn!(kind = %self.shared.store.kind(), error = %e, "watch: task ended abnormally");
            }
        }
    }
}

/// Starts and tracks subscriptions, at most one live per store.
pub struct KubeWatchApi {
    backoff: BackoffPolicy,
    watch: WatchOptions,
    subs: Mutex<FxHashMap<String, WatchSubscription>>,
}

impl std::fmt::Debug for KubeWatchApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchApi").field("backoff", &self.backoff).field("watch", &self.watch).finish()
    }
}

impl KubeWatchApi {
    pub fn new(backoff: BackoffPolicy, watch: WatchOptions) -> Self {
        Self { backoff, watch, subs: Mutex::new(FxHashMap::default()) }
    }

    fn subs(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, WatchSubscription>> {
        self.subs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start syncing `store`. If the store already has a live subscription, that one is returned.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe(&self, store: Arc<KubeObjectStore>, opts: SubscribeOptions) -> WatchSubscription {
        let key = store.resource().api_base();
        let mut subs = self.subs();
        if let Some(live) = subs.get(&key).filter(|s| !s.is_closed()) {
            debug!(kind = %store.kind(), "watch: reusing live subscription");
            return live.clone();
        }

        let follows_selection = opts.namespaces.is_none();
        let namespaces = opts.namespaces.unwrap_or_else(|| store.selection().namespaces());
        let shared = Arc::new(Shared {
            generation: store.generation(),
            store,
            follows_selection,
            on_load_failure: opts.on_load_failure.clone(),
            board: StatusBoard::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let runner = Runner {
            shared: shared.clone(),
            namespaces,
            backoff: self.backoff,
            watch: self.watch.clone(),
            on_load_failure: opts.on_load_failure,
        };
        let handle = tokio::spawn(async move { runner.run().await });
        *shared.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        let sub = WatchSubscription { shared };
        subs.insert(key, sub.clone());
        sub
    }

    /// Live subscription for a store, if any.
    pub fn subscription(&self, store: &KubeObjectStore) -> Option<WatchSubscription> {
        self.subs().get(&store.resource().api_base()).filter(|s| !s.is_closed()).cloned()
    }

    pub fn subscriptions(&self) -> Vec<WatchSubscription> {
        self.subs().values().filter(|s| !s.is_closed()).cloned().collect()
    }

    /// Close every subscription and return them so callers can await [`WatchSubscription::closed`].
    pub fn unsubscribe_all(&self) -> Vec<WatchSubscription> {
        let subs: Vec<WatchSubscription> = self.subs().drain().map(|(_, s)| s).collect();
        for s in &subs {
            s.unsubscribe();
        }
        subs
    }
}

struct Runner {
    shared: Arc<Shared>,
    namespaces: Vec<String>,
    backoff: BackoffPolicy,
    watch: WatchOptions,
    on_load_failure: Option<LoadFailureFn>,
}

/// Why a worker stopped.
enum Stop {
    Cancelled,
    Detached,
}

impl Runner {
    fn store(&self) -> &KubeObjectStore {
        &self.shared.store
    }

    fn report(&self, failure: &LoadError) {
        if let Some(cb) = &self.on_load_failure {
            cb(failure);
        }
    }

    async fn run(self) {
        let kind = self.store().kind().to_string();
        let t0 = Instant::now();
        let summary = match self.initial_load().await {
            Ok(s) => s,
            Err(Stop::Cancelled) | Err(Stop::Detached) => return,
        };

        // one worker per scope, failed scopes start by relisting
        let mut scopes: Vec<(Option<String>, Option<ResourceVersion>)> =
            summary.cursors.into_iter().map(|(scope, rv)| (scope, Some(rv))).collect();
        scopes.extend(summary.errors.iter().map(|e| (e.namespace.clone(), None)));
        scopes.sort_by(|a, b| a.0.cmp(&b.0));
        info!(kind = %kind, scopes = scopes.len(), failed = summary.errors.len(), took_ms = %t0.elapsed().as_millis(), "watch: initial load ok");

        self.shared.board.reset(scopes.len(), SubscriptionStatus::Connecting);
        let workers = scopes.into_iter().enumerate().map(|(i, (scope, cursor))| self.watch_scope(i, scope, cursor));
        let stops = join_all(workers).await;
        if stops.iter().any(|s| matches!(s, Stop::Detached)) && !self.shared.cancel.is_cancelled() {
            warn!(kind = %kind, "watch: store detached underneath a live subscription");
        }
        debug!(kind = %kind, "watch: subscription task done");
    }

    async fn initial_load(&self) -> Result<LoadSummary, Stop> {
        let mut backoff = self.backoff.start();
        self.shared.board.set_all(SubscriptionStatus::Connecting);
        loop {
            let res = tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(Stop::Cancelled),
                r = self.store().load_all_in(self.shared.generation, &self.namespaces) => r,
            };
            match res {
                Ok(summary) => {
                    for e in &summary.errors {
                        self.report(e);
                    }
                    return Ok(summary);
                }
                Err(SyncError::Detached) => return Err(Stop::Detached),
                Err(error) => {
                    warn!(kind = %self.store().kind(), error = %error, attempt = backoff.attempt() + 1, "watch: initial load failed");
                    self.report(&LoadError { namespace: None, error });
                    // stays Connecting until the first list succeeds
                    if !self.sleep(&mut backoff).await {
                        return Err(Stop::Cancelled);
                    }
                }
            }
        }
    }

    async fn pause(&self, idx: usize, backoff: &mut Backoff) -> bool {
        self.shared.board.set(idx, SubscriptionStatus::Backoff);
        let ok = self.sleep(backoff).await;
        self.shared.board.set(idx, SubscriptionStatus::Connecting);
        ok
    }

    /// Sleep for the next backoff delay; `false` when cancelled meanwhile.
    async fn sleep(&self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = self.shared.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// List one scope again, replacing its content in the store.
    async fn relist(&self, scope: Option<&str>) -> SyncResult<ResourceVersion> {
        let namespaces: Vec<String> = scope.map(|s| vec![s.to_string()]).unwrap_or_default();
        let summary = self.store().load_all_in(self.shared.generation, &namespaces).await?;
        summary
            .cursors
            .into_iter()
            .next()
            .map(|(_, rv)| rv)
            .ok_or_else(|| SyncError::InconsistentState("relist returned no cursor".to_string()))
    }

    async fn watch_scope(&self, idx: usize, scope: Option<String>, mut cursor: Option<ResourceVersion>) -> Stop {
        let kind = self.store().kind().to_string();
        let ns = scope.as_deref().unwrap_or("(all)").to_string();
        let api = self.store().api().clone();
        let mut backoff = self.backoff.start();

        loop {
            if self.shared.cancel.is_cancelled() {
                return Stop::Cancelled;
            }
            let rv = match cursor.take() {
                Some(rv) => rv,
                None => {
                    counter!("kide_watch_relists_total", 1, "kind" => kind.clone());
                    let res = tokio::select! {
                        _ = self.shared.cancel.cancelled() => return Stop::Cancelled,
                        r = self.relist(scope.as_deref()) => r,
                    };
                    match res {
                        Ok(rv) => {
                            info!(kind = %kind, ns = %ns, rv = %rv, "watch: relisted");
                            rv
                        }
                        Err(SyncError::Detached) => return Stop::Detached,
                        Err(error) => {
                            warn!(kind = %kind, ns = %ns, error = %error, "watch: relist failed");
                            self.report(&LoadError { namespace: scope.clone(), error });
                            self.shared.board.set(idx, SubscriptionStatus::Errored);
                            if !self.pause(idx, &mut backoff).await {
                                return Stop::Cancelled;
                            }
                            continue;
                        }
                    }
                }
            };

            let opened = tokio::select! {
                _ = self.shared.cancel.cancelled() => return Stop::Cancelled,
                r = api.watch(scope.as_deref(), &rv, &self.watch) => r,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(e) if e.is_expired() => {
                    debug!(kind = %kind, ns = %ns, rv = %rv, "watch: cursor expired on open");
                    continue;
                }
                Err(error) => {
                    warn!(kind = %kind, ns = %ns, error = %error, "watch: open failed");
                    cursor = Some(rv);
                    self.shared.board.set(idx, SubscriptionStatus::Errored);
                    if !self.pause(idx, &mut backoff).await {
                        return Stop::Cancelled;
                    }
                    continue;
                }
            };
            self.shared.board.set(idx, SubscriptionStatus::Active);
            backoff.reset();

            let mut last = rv;
            let ended = loop {
                let next = tokio::select! {
                    _ = self.shared.cancel.cancelled() => return Stop::Cancelled,
                    n = stream.next() => n,
                };
                let (event, obj) = match next {
                    None => break None,
                    Some(Ok(WatchItem::Bookmark(v))) => {
                        last = v;
                        continue;
                    }
                    Some(Ok(WatchItem::Added(o))) => (EventType::Add, o),
                    Some(Ok(WatchItem::Modified(o))) => (EventType::Update, o),
                    Some(Ok(WatchItem::Deleted(o))) => (EventType::Delete, o),
                    Some(Err(e @ (SyncError::MalformedObject { .. } | SyncError::Decode(_)))) => {
                        warn!(kind = %kind, ns = %ns, error = %e, "watch: skipping undecodable event");
                        continue;
                    }
                    Some(Err(e)) => break Some(e),
                };
                let rv = obj.resource_version().clone();
                if self.store().handle_watch_event_in(self.shared.generation, event, obj).is_err() {
                    return Stop::Detached;
                }
                last = rv;
            };

            match ended {
                None => {
                    counter!("kide_watch_reconnects_total", 1, "kind" => kind.clone());
                    debug!(kind = %kind, ns = %ns, rv = %last, "watch: stream ended, reconnecting");
                    cursor = Some(last);
                }
                Some(e) if e.is_expired() => {
                    debug!(kind = %kind, ns = %ns, rv = %last, "watch: cursor expired");
                }
                Some(error) => {
                    counter!("kide_watch_reconnects_total", 1, "kind" => kind.clone());
                    warn!(kind = %kind, ns = %ns, error = %error, "watch: stream failed");
                    cursor = Some(last);
                    self.shared.board.set(idx, SubscriptionStatus::Errored);
                    if !self.pause(idx, &mut backoff).await {
                        return Stop::Cancelled;
                    }
                }
            }
        }
    }
}
