#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kide_api::{ClusterContext, LoadError, SubscribeOptions, SubscriptionStatus, SyncConfig, SyncError};
use kide_kubehub::fake::{FakeTransport, WatchReply};
use kide_kubehub::TransportError;
use kube::core::{ErrorResponse, WatchEvent};
use serde_json::{json, Value};

fn config() -> SyncConfig {
    SyncConfig {
        request_timeout_ms: 2_000,
        retry_attempts: 1,
        retry_min_ms: 1,
        retry_max_ms: 2,
        watch_backoff_min_ms: 5,
        watch_backoff_max_ms: 20,
        ..SyncConfig::default()
    }
}

fn pod(name: &str, ns: &str, uid: u8, rv: &str) -> Value {
    json!({
        "metadata": {
            "name": name,
            "namespace": ns,
            "uid": format!("00000000-0000-0000-0000-{:012}", uid),
            "resourceVersion": rv
        }
    })
}

fn list(rv: &str, items: Vec<Value>) -> Value {
    json!({ "kind": "PodList", "apiVersion": "v1", "metadata": { "resourceVersion": rv }, "items": items })
}

fn expired() -> WatchEvent<Value> {
    WatchEvent::Error(ErrorResponse {
        status: "Failure".into(),
        message: "too old resource version".into(),
        reason: "Expired".into(),
        code: 410,
    })
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn watches(fake: &FakeTransport) -> Vec<String> {
    fake.requests().into_iter().filter(|r| r.starts_with("WATCH")).collect()
}

#[tokio::test]
async fn initial_load_then_live_events() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/pods", Ok(list("10", vec![pod("a", "shop", 1, "9")])));
    let tx = fake.watch_channel("/api/v1/pods");
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let sub = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");
    let store = sub.store().clone();

    wait_until("active", || sub.status() == SubscriptionStatus::Active).await;
    assert!(store.get_by_name("a", Some("shop")).is_some());
    assert!(watches(&fake)[0].contains("resourceVersion=10"));

    tx.unbounded_send(Ok(WatchEvent::Added(pod("b", "shop", 2, "11")))).unwrap();
    tx.unbounded_send(Ok(WatchEvent::Modified(pod("a", "shop", 1, "12")))).unwrap();
    tx.unbounded_send(Ok(WatchEvent::Deleted(pod("b", "shop", 2, "13")))).unwrap();
    wait_until("events applied", || {
        store.get_by_name("a", Some("shop")).is_some_and(|o| o.resource_version().as_str() == "12")
            && store.get_by_name("b", Some("shop")).is_none()
    })
    .await;
    assert_eq!(store.total_count(), 1);

    ctx.shutdown().await;
    assert_eq!(sub.status(), SubscriptionStatus::Closed);
}

#[tokio::test]
async fn expired_cursor_relists_and_drops_vanished_objects() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond_once("GET", "/api/v1/pods", Ok(list("10", vec![pod("a", "shop", 1, "5"), pod("b", "shop", 2, "6")])));
    fake.respond("GET", "/api/v1/pods", Ok(list("20", vec![pod("a", "shop", 1, "15")])));
    fake.script_watch("/api/v1/pods", WatchReply::FramesThenClose(vec![Ok(expired())]));
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let sub = ctx.subscribe("v1/Pod", SubscribeOptions::default()).expect("subscribe");
    let store = sub.store().clone();

    wait_until("relist", || fake.count("GET /api/v1/pods") >= 2 && watches(&fake).len() >= 2).await;
    wait_until("b dropped", || store.get_by_name("b", Some("shop")).is_none()).await;
    assert_eq!(store.get_by_name("a", Some("shop")).unwrap().resource_version().as_str(), "15");
    assert!(watches(&fake)[1].contains("resourceVersion=20"));
    sub.unsubscribe();
}

#[tokio::test]
async fn expired_cursor_on_open_relists_and_resumes_from_fresh_list() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond_once("GET", "/api/v1/pods", Ok(list("10", vec![pod("a", "shop", 1, "5"), pod("b", "shop", 2, "6")])));
    fake.respond("GET", "/api/v1/pods", Ok(list("20", vec![pod("a", "shop", 1, "15")])));
    fake.script_watch(
        "/api/v1/pods",
        WatchReply::Fail(TransportError::Status { code: 410, message: "too old resource version".into() }),
    );
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let sub = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");
    let store = sub.store().clone();

    wait_until("active after relist", || sub.status() == SubscriptionStatus::Active).await;
    assert_eq!(fake.count("GET /api/v1/pods"), 2);
    let opened = watches(&fake);
    assert_eq!(opened.len(), 2);
    assert!(opened[0].contains("resourceVersion=10"));
    assert!(opened[1].contains("resourceVersion=20"));
    assert!(store.get_by_name("b", Some("shop")).is_none());
    assert_eq!(store.get_by_name("a", Some("shop")).unwrap().resource_version().as_str(), "15");
    sub.unsubscribe();
}

#[tokio::test]
async fn clean_stream_end_reconnects_from_cursor() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/pods", Ok(list("10", Vec::new())));
    fake.script_watch("/api/v1/pods", WatchReply::FramesThenClose(vec![Ok(WatchEvent::Added(pod("c", "shop", 3, "15")))]));
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let sub = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");

    wait_until("reconnect", || watches(&fake).len() >= 2).await;
    assert!(watches(&fake)[1].contains("resourceVersion=15"));
    assert_eq!(fake.count("GET /api/v1/pods"), 1, "no relist on a clean end");
    assert!(sub.store().get_by_name("c", Some("shop")).is_some());
    sub.unsubscribe();
}

#[tokio::test]
async fn failed_namespace_is_reported_and_others_load() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/namespaces/a/pods", Ok(list("10", vec![pod("p", "a", 1, "5")])));
    fake.respond("GET", "/api/v1/namespaces/b/pods", Err(TransportError::Status { code: 403, message: "forbidden".into() }));
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");

    let seen: Arc<Mutex<Vec<LoadError>>> = Arc::default();
    let sink = seen.clone();
    let opts = SubscribeOptions {
        namespaces: Some(vec!["a".into(), "b".into()]),
        on_load_failure: Some(Arc::new(move |e: &LoadError| sink.lock().unwrap().push(e.clone()))),
    };
    let sub = ctx.subscribe("pods", opts).expect("subscribe");

    wait_until("failure reported", || !seen.lock().unwrap().is_empty()).await;
    let first = seen.lock().unwrap()[0].clone();
    assert_eq!(first.namespace.as_deref(), Some("b"));
    assert!(matches!(first.error, SyncError::AccessDenied(_)));
    assert!(sub.store().get_by_name("p", Some("a")).is_some());
    assert!(watches(&fake).iter().any(|w| w.starts_with("WATCH /api/v1/namespaces/a/pods")));

    // the failing namespace keeps being retried with backoff
    wait_until("retry", || seen.lock().unwrap().len() >= 2).await;
    sub.unsubscribe();
}

#[tokio::test]
async fn initial_load_retries_until_it_succeeds() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond_once("GET", "/api/v1/pods", Err(TransportError::Status { code: 500, message: "down".into() }));
    fake.respond("GET", "/api/v1/pods", Ok(list("10", vec![pod("a", "shop", 1, "5")])));
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let failures = Arc::new(Mutex::new(0usize));
    let counter = failures.clone();
    let opts = SubscribeOptions {
        namespaces: None,
        on_load_failure: Some(Arc::new(move |_: &LoadError| *counter.lock().unwrap() += 1)),
    };
    let sub = ctx.subscribe("Pod", opts).expect("subscribe");
    wait_until("active", || sub.status() == SubscriptionStatus::Active).await;
    assert_eq!(*failures.lock().unwrap(), 1);
    assert!(sub.store().is_loaded());
    sub.unsubscribe();
}

#[tokio::test]
async fn failing_initial_load_stays_connecting() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/pods", Err(TransportError::Status { code: 403, message: "forbidden".into() }));
    let cfg = SyncConfig { watch_backoff_min_ms: 300, watch_backoff_max_ms: 600, ..config() };
    let ctx = ClusterContext::init(cfg, fake.clone()).expect("init");
    let failures = Arc::new(Mutex::new(0usize));
    let counter = failures.clone();
    let opts = SubscribeOptions {
        namespaces: None,
        on_load_failure: Some(Arc::new(move |_: &LoadError| *counter.lock().unwrap() += 1)),
    };
    let sub = ctx.subscribe("Pod", opts).expect("subscribe");

    wait_until("first failure", || *failures.lock().unwrap() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sub.status(), SubscriptionStatus::Connecting);
    assert!(watches(&fake).is_empty(), "no watch before a successful list");

    wait_until("retried", || *failures.lock().unwrap() >= 2).await;
    assert_eq!(sub.status(), SubscriptionStatus::Connecting);
    sub.unsubscribe();
    assert_eq!(sub.status(), SubscriptionStatus::Closed);
}

#[tokio::test]
async fn unsubscribe_is_idempotent_under_concurrency() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/pods", Ok(list("10", Vec::new())));
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let sub = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");
    let again = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");
    let generation = sub.store().generation();

    let (a, b) = (sub.clone(), again.clone());
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.unsubscribe() }),
        tokio::spawn(async move { b.unsubscribe() }),
    );
    let closed_by = [ra.unwrap(), rb.unwrap()];
    assert_eq!(closed_by.iter().filter(|c| **c).count(), 1, "exactly one call closes");
    assert!(sub.is_closed() && again.is_closed(), "second subscribe returned the live one");
    assert_eq!(sub.status(), SubscriptionStatus::Closed);
    assert_eq!(sub.store().generation(), generation + 1);
    assert!(!sub.unsubscribe());
    sub.closed().await;

    let fresh = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");
    assert!(!fresh.is_closed());
    fresh.unsubscribe();
}

#[tokio::test]
async fn narrowing_the_selection_evicts_and_restarts() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/pods", Ok(list("10", vec![pod("a", "x", 1, "5"), pod("b", "y", 2, "6")])));
    fake.respond("GET", "/api/v1/namespaces/x/pods", Ok(list("11", vec![pod("a", "x", 1, "5")])));
    let ctx = ClusterContext::init(config(), fake.clone()).expect("init");
    let sub = ctx.subscribe("Pod", SubscribeOptions::default()).expect("subscribe");
    wait_until("active", || sub.status() == SubscriptionStatus::Active).await;
    assert_eq!(sub.store().total_count(), 2);

    let restarted = ctx.select_namespaces(["x"]);
    assert_eq!(restarted.len(), 1);
    assert!(sub.is_closed());
    let store = restarted[0].store().clone();
    assert!(store.get_by_name("b", Some("y")).is_none());
    wait_until("restarted", || restarted[0].status() == SubscriptionStatus::Active).await;
    assert!(watches(&fake).iter().any(|w| w.starts_with("WATCH /api/v1/namespaces/x/pods")));
    assert_eq!(store.context_items().len(), 1);
    ctx.shutdown().await;
}
