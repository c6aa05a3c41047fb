#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kide_core::{EventType, KubeObject, SyncError, Uid};
use kide_kubehub::fake::FakeTransport;
use kide_kubehub::{ApiResourceDef, KubeApi, RetryPolicy};
use kide_store::{EventOutcome, KubeObjectStore, NamespaceSelection, StoreChange, StoreOptions};
use serde_json::json;

fn uid_str(n: u8) -> String {
    format!("00000000-0000-0000-0000-{:012}", n)
}

fn pod(name: &str, ns: &str, uid: u8, rv: &str) -> KubeObject {
    KubeObject::from_value(json!({
        "kind": "Pod",
        "apiVersion": "v1",
        "metadata": { "name": name, "namespace": ns, "uid": uid_str(uid), "resourceVersion": rv, "labels": { "app": name } }
    }))
    .expect("valid pod")
}

fn store(opts: StoreOptions) -> KubeObjectStore {
    let fake = Arc::new(FakeTransport::new());
    let retry = RetryPolicy { max_attempts: 1, min_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1), request_timeout: Duration::from_secs(1) };
    let api = KubeApi::new(ApiResourceDef::new("", "v1", "Pod", "pods", true), fake, retry);
    KubeObjectStore::new(Arc::new(api), NamespaceSelection::new(), opts)
}

#[test]
fn replay_keeps_highest_version() {
    let s = store(StoreOptions::default());
    assert_eq!(s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "3")), EventOutcome::Inserted);
    assert_eq!(s.handle_watch_event(EventType::Update, pod("a", "ns", 1, "5")), EventOutcome::Replaced);
    // redelivered older update
    assert_eq!(s.handle_watch_event(EventType::Update, pod("a", "ns", 1, "4")), EventOutcome::Stale);
    // equal version is a duplicate
    assert_eq!(s.handle_watch_event(EventType::Update, pod("a", "ns", 1, "5")), EventOutcome::Stale);
    let held = s.get_by_id(&Uid::parse(&uid_str(1)).unwrap()).unwrap();
    assert_eq!(held.resource_version().as_str(), "5");
    assert_eq!(s.total_count(), 1);
}

#[test]
fn versions_compare_numerically() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "9"));
    assert_eq!(s.handle_watch_event(EventType::Update, pod("a", "ns", 1, "10")), EventOutcome::Replaced);
}

#[test]
fn add_for_held_uid_is_rejected() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "1"));
    let out = s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "2"));
    assert!(matches!(out, EventOutcome::Rejected(SyncError::InconsistentState(_))), "{out:?}");
    assert_eq!(s.get_by_name("a", Some("ns")).unwrap().resource_version().as_str(), "1");
}

#[test]
fn delete_removes_and_tombstone_blocks_late_add() {
    let s = store(StoreOptions::default());
    let uid = Uid::parse(&uid_str(1)).unwrap();
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "1"));
    assert_eq!(s.handle_watch_event(EventType::Delete, pod("a", "ns", 1, "2")), EventOutcome::Removed);
    assert!(s.get_by_id(&uid).is_none());
    assert!(s.get_by_path("/api/v1/namespaces/ns/pods/a").is_none());
    // late duplicate of the original add
    assert_eq!(s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "1")), EventOutcome::Stale);
    assert!(s.get_by_id(&uid).is_none());
    // a delete for something never seen is harmless
    assert_eq!(s.handle_watch_event(EventType::Delete, pod("z", "ns", 9, "4")), EventOutcome::Missing);
    assert_eq!(s.tombstone_count(), 2);
    assert_eq!(s.tombstones_evicted(), 0);
}

#[test]
fn late_delete_of_old_uid_keeps_recreated_name_reachable() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("web-0", "shop", 1, "1"));
    // recreated under the same name before the old delete arrives
    s.handle_watch_event(EventType::Add, pod("web-0", "shop", 2, "5"));
    assert_eq!(s.handle_watch_event(EventType::Delete, pod("web-0", "shop", 1, "4")), EventOutcome::Removed);

    assert_eq!(s.total_count(), 1);
    let live = Uid::parse(&uid_str(2)).unwrap();
    assert_eq!(s.get_by_path("/api/v1/namespaces/shop/pods/web-0").map(|o| o.uid()), Some(live));
    assert_eq!(s.get_by_name("web-0", Some("shop")).map(|o| o.uid()), Some(live));

    // eviction removes the live owner of the path
    assert_eq!(s.evict_namespace("shop"), 1);
    assert!(s.get_by_name("web-0", Some("shop")).is_none());
}

#[test]
fn stale_delete_is_ignored() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "7"));
    assert_eq!(s.handle_watch_event(EventType::Delete, pod("a", "ns", 1, "6")), EventOutcome::Stale);
    assert_eq!(s.total_count(), 1);
}

#[test]
fn zero_tombstones_allow_resurrection() {
    let s = store(StoreOptions { tombstone_capacity: 0, ..Default::default() });
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "1"));
    s.handle_watch_event(EventType::Delete, pod("a", "ns", 1, "2"));
    assert_eq!(s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "1")), EventOutcome::Inserted);
}

#[test]
fn lookups_by_path_name_and_labels() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("web", "shop", 1, "1"));
    s.handle_watch_event(EventType::Add, pod("db", "shop", 2, "1"));
    assert_eq!(s.get_by_path("/api/v1/namespaces/shop/pods/web?x=1").unwrap().name(), "web");
    assert_eq!(s.get_by_name("db", Some("shop")).unwrap().uid(), Uid::parse(&uid_str(2)).unwrap());
    assert!(s.get_by_name("db", Some("other")).is_none());
    let sel: BTreeMap<String, String> = [("app".to_string(), "web".to_string())].into_iter().collect();
    let hits = s.get_by_labels(&sel);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name(), "web");
}

#[test]
fn revision_bumps_only_on_visible_change() {
    let s = store(StoreOptions::default());
    let r0 = s.revision();
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "2"));
    let r1 = s.revision();
    assert!(r1 > r0);
    s.handle_watch_event(EventType::Update, pod("a", "ns", 1, "1"));
    assert_eq!(s.revision(), r1);
}

#[test]
fn changes_are_broadcast() {
    let s = store(StoreOptions::default());
    let mut rx = s.changes();
    s.handle_watch_event(EventType::Add, pod("a", "ns", 1, "1"));
    s.handle_watch_event(EventType::Delete, pod("a", "ns", 1, "2"));
    assert!(matches!(rx.try_recv(), Ok(StoreChange::Upserted(o)) if o.name() == "a"));
    assert!(matches!(rx.try_recv(), Ok(StoreChange::Removed(o)) if o.name() == "a"));
    assert!(rx.try_recv().is_err());
}

#[test]
fn context_items_follow_selection() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("b", "prod", 1, "1"));
    s.handle_watch_event(EventType::Add, pod("a", "prod", 2, "1"));
    s.handle_watch_event(EventType::Add, pod("c", "dev", 3, "1"));
    let all = s.context_items();
    assert_eq!(all.len(), 3);
    // cached until something changes
    assert!(Arc::ptr_eq(&all, &s.context_items()));

    s.selection().set(["prod"]);
    let names: Vec<_> = s.context_items().iter().map(|o| o.name().to_string()).collect();
    assert_eq!(names, vec!["a", "b"]);

    s.handle_watch_event(EventType::Add, pod("d", "prod", 4, "1"));
    assert_eq!(s.context_items().len(), 3);
}

#[test]
fn evict_namespace_drops_entries() {
    let s = store(StoreOptions::default());
    s.handle_watch_event(EventType::Add, pod("a", "prod", 1, "1"));
    s.handle_watch_event(EventType::Add, pod("b", "dev", 2, "1"));
    assert_eq!(s.evict_namespace("dev"), 1);
    assert!(s.get_by_name("b", Some("dev")).is_none());
    assert_eq!(s.total_count(), 1);
    assert_eq!(s.evict_namespace("dev"), 0);
}

#[test]
fn detached_generation_rejects_events() {
    let s = store(StoreOptions::default());
    let generation = s.generation();
    s.detach();
    let res = s.handle_watch_event_in(generation, EventType::Add, pod("a", "ns", 1, "1"));
    assert_eq!(res, Err(SyncError::Detached));
    assert_eq!(s.total_count(), 0);
    let current = s.generation();
    assert_eq!(s.handle_watch_event_in(current, EventType::Add, pod("a", "ns", 1, "1")), Ok(EventOutcome::Inserted));
}
