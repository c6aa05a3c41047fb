#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kide_core::{ResourceVersion, SyncError};
use kide_kubehub::fake::{FakeTransport, WatchReply};
use kide_kubehub::{ApiResourceDef, KubeApi, ListOptions, PatchBody, RetryPolicy, TransportError, WatchItem, WatchOptions};
use kube::core::{ErrorResponse, WatchEvent};
use serde_json::json;

fn quick() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        request_timeout: Duration::from_secs(2),
    }
}

fn pods(fake: &Arc<FakeTransport>) -> KubeApi {
    KubeApi::new(ApiResourceDef::new("", "v1", "Pod", "pods", true), fake.clone(), quick())
}

fn item(name: &str, uid: u8, rv: &str) -> serde_json::Value {
    json!({
        "metadata": {
            "name": name,
            "namespace": "shop",
            "uid": format!("00000000-0000-0000-0000-{:012}", uid),
            "resourceVersion": rv
        }
    })
}

#[tokio::test]
async fn list_fills_kind_and_returns_cursor() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond(
        "GET",
        "/api/v1/namespaces/shop/pods",
        Ok(json!({
            "kind": "PodList",
            "apiVersion": "v1",
            "metadata": { "resourceVersion": "100" },
            "items": [item("a", 1, "90"), item("b", 2, "95"), { "metadata": { "name": "broken" } }]
        })),
    );
    let api = pods(&fake);
    let opts = ListOptions { label_selector: Some("app=web".into()), ..Default::default() };
    let list = api.list(Some("shop"), &opts).await.expect("list");
    assert_eq!(list.resource_version, ResourceVersion::from("100"));
    assert_eq!(list.items.len(), 2, "malformed item skipped");
    assert_eq!(list.items[0].kind(), "Pod");
    assert_eq!(list.items[0].api_version(), "v1");
    assert_eq!(fake.requests(), vec!["GET /api/v1/namespaces/shop/pods?labelSelector=app%3Dweb".to_string()]);
}

#[tokio::test]
async fn access_denied_is_not_retried() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/pods", Err(TransportError::Status { code: 403, message: "forbidden".into() }));
    let err = pods(&fake).list(None, &ListOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(_)));
    assert_eq!(fake.count("GET"), 1);
}

#[tokio::test]
async fn transient_errors_retry_then_succeed() {
    let fake = Arc::new(FakeTransport::new());
    let path = "/api/v1/namespaces/shop/pods/a";
    fake.respond_once("GET", path, Err(TransportError::Status { code: 503, message: "busy".into() }));
    fake.respond("GET", path, Ok(json!({ "kind": "Pod", "apiVersion": "v1", "metadata": item("a", 1, "7")["metadata"] })));
    let pod = pods(&fake).get("a", Some("shop")).await.expect("second attempt succeeds");
    assert_eq!(pod.name(), "a");
    assert_eq!(fake.count("GET"), 2);
}

#[tokio::test]
async fn transient_errors_exhaust_into_transient_fetch() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/namespaces/shop/pods", Err(TransportError::Connect("connection reset".into())));
    let err = pods(&fake).list(Some("shop"), &ListOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::TransientFetch { attempts: 3, .. }), "{err:?}");
    assert_eq!(fake.count("GET"), 3);
}

#[tokio::test]
async fn not_found_and_invalid_names() {
    let fake = Arc::new(FakeTransport::new());
    let api = pods(&fake);
    assert!(matches!(api.get("missing", Some("shop")).await, Err(SyncError::NotFound(_))));
    assert!(matches!(api.delete("bad/name", Some("shop")).await, Err(SyncError::InvalidName(_))));
    assert_eq!(fake.count(""), 1, "invalid name never reaches the wire");
}

#[tokio::test]
async fn mutations_hit_the_right_urls() {
    let fake = Arc::new(FakeTransport::new());
    let body = json!({ "kind": "Pod", "apiVersion": "v1", "metadata": item("a", 1, "8")["metadata"] });
    fake.respond("POST", "/api/v1/namespaces/shop/pods", Ok(body.clone()));
    fake.respond("PUT", "/api/v1/namespaces/shop/pods/a", Ok(body.clone()));
    fake.respond("PATCH", "/api/v1/namespaces/shop/pods/a", Ok(body.clone()));
    fake.respond("DELETE", "/api/v1/namespaces/shop/pods/a", Ok(json!({ "kind": "Status", "status": "Success" })));
    let api = pods(&fake);
    api.create(Some("shop"), &body).await.expect("create");
    api.update("a", Some("shop"), &body).await.expect("update");
    api.patch("a", Some("shop"), &PatchBody::Merge(json!({ "metadata": { "labels": { "x": "y" } } })))
        .await
        .expect("patch");
    api.delete("a", Some("shop")).await.expect("delete");
    let methods: Vec<String> = fake.requests().iter().map(|r| r.split(' ').next().unwrap().to_string()).collect();
    assert_eq!(methods, vec!["POST", "PUT", "PATCH", "DELETE"]);
}

#[tokio::test]
async fn cluster_scoped_kinds_ignore_namespace() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond("GET", "/api/v1/nodes", Ok(json!({ "metadata": { "resourceVersion": "3" }, "items": [] })));
    let nodes = KubeApi::new(ApiResourceDef::new("", "v1", "Node", "nodes", false), fake.clone(), quick());
    let list = nodes.list(Some("shop"), &ListOptions::default()).await.expect("list");
    assert!(list.items.is_empty());
    assert_eq!(fake.requests(), vec!["GET /api/v1/nodes".to_string()]);
}

#[tokio::test]
async fn watch_maps_events_and_expiry() {
    let fake = Arc::new(FakeTransport::new());
    let path = "/api/v1/namespaces/shop/pods";
    fake.script_watch(path, WatchReply::Fail(TransportError::Status { code: 410, message: "too old".into() }));
    fake.script_watch(
        path,
        WatchReply::FramesThenClose(vec![
            Ok(WatchEvent::Added(item("a", 1, "11"))),
            Ok(WatchEvent::Modified(item("a", 1, "12"))),
            Ok(WatchEvent::Error(ErrorResponse {
                status: "Failure".into(),
                message: "too old resource version".into(),
                reason: "Expired".into(),
                code: 410,
            })),
        ]),
    );
    let api = pods(&fake);
    let cursor = ResourceVersion::from("10");
    let err = api.watch(Some("shop"), &cursor, &WatchOptions::default()).await.err().expect("410 on open");
    assert!(err.is_expired());

    let mut stream = api.watch(Some("shop"), &cursor, &WatchOptions::default()).await.expect("open");
    assert!(matches!(stream.next().await, Some(Ok(WatchItem::Added(o))) if o.resource_version().as_str() == "11"));
    assert!(matches!(stream.next().await, Some(Ok(WatchItem::Modified(o))) if o.kind() == "Pod"));
    assert!(matches!(stream.next().await, Some(Err(SyncError::ResourceVersionExpired(_)))));
    assert!(stream.next().await.is_none());

    let watch_uri = fake.requests().into_iter().find(|r| r.starts_with("WATCH")).unwrap();
    assert!(watch_uri.contains("watch=true"));
    assert!(watch_uri.contains("resourceVersion=10"));
    assert!(watch_uri.contains("allowWatchBookmarks=true"));
}
