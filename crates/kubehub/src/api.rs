//! REST client for one resource kind.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::BoxStream;
use futures::StreamExt;
use kide_core::{KubeObject, ResourceVersion, SyncError, SyncResult};
use kube::core::WatchEvent;
use metrics::histogram;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::resource::ApiResourceDef;
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{Transport, TransportError};

/// Names that can never be valid for any kind. Full validation is left to the server.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._:@-]*[A-Za-z0-9])?$").expect("static regex"));

pub fn validate_name(name: &str) -> SyncResult<()> {
    if name.is_empty() || name.len() > 253 || name == "." || name == ".." || !NAME_RE.is_match(name) {
        return Err(SyncError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Selectors and paging for `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
}

/// Parameters for `watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Server-side timeout; the server closes the stream after this.
    pub timeout_secs: u32,
    pub bookmarks: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { label_selector: None, field_selector: None, timeout_secs: 290, bookmarks: true }
    }
}

/// Patch flavours, each with its own content type.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchBody {
    Merge(Value),
    StrategicMerge(Value),
    Json(Value),
}

impl PatchBody {
    fn content_type(&self) -> &'static str {
        match self {
            PatchBody::Merge(_) => "application/merge-patch+json",
            PatchBody::StrategicMerge(_) => "application/strategic-merge-patch+json",
            PatchBody::Json(_) => "application/json-patch+json",
        }
    }

    fn body(&self) -> &Value {
        match self {
            PatchBody::Merge(v) | PatchBody::StrategicMerge(v) | PatchBody::Json(v) => v,
        }
    }
}

/// Result of a list call.
#[derive(Debug, Clone)]
pub struct ObjectList {
    pub items: Vec<KubeObject>,
    /// Collection version, the cursor a watch resumes from.
    pub resource_version: ResourceVersion,
}

/// One item of a watch stream.
#[derive(Debug, Clone)]
pub enum WatchItem {
    Added(KubeObject),
    Modified(KubeObject),
    Deleted(KubeObject),
    Bookmark(ResourceVersion),
}

pub type ObjectStream = BoxStream<'static, SyncResult<WatchItem>>;

/// Map a transport failure onto the sync error taxonomy.
pub fn classify(err: TransportError, what: &str) -> SyncError {
    match err {
        TransportError::Status { code: 401 | 403, message } => SyncError::AccessDenied(format!("{}: {}", what, message)),
        TransportError::Status { code: 404, message } => SyncError::NotFound(format!("{}: {}", what, message)),
        TransportError::Status { code: 410, message } => SyncError::ResourceVersionExpired(format!("{}: {}", what, message)),
        TransportError::Status { code: code @ (408 | 429 | 500 | 502 | 503 | 504), message } => {
            SyncError::TransientFetch { attempts: 1, message: format!("{}: status {}: {}", what, code, message) }
        }
        TransportError::Status { code, message } => SyncError::Api { code, message: format!("{}: {}", what, message) },
        TransportError::Connect(m) => SyncError::TransientFetch { attempts: 1, message: format!("{}: {}", what, m) },
        TransportError::Timeout => SyncError::TransientFetch { attempts: 1, message: format!("{}: timed out", what) },
        TransportError::Decode(m) => SyncError::Decode(format!("{}: {}", what, m)),
    }
}

fn path_with_query(path: String, pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return path;
    }
    let mut qp = form_urlencoded::Serializer::new(format!("{}?", path));
    for (k, v) in pairs {
        qp.append_pair(k, v);
    }
    qp.finish()
}

fn build(method: http::Method, uri: String, body: Vec<u8>, content_type: Option<&str>) -> SyncResult<http::Request<Vec<u8>>> {
    let mut b = http::Request::builder().method(method).uri(uri).header("Accept", "application/json");
    if let Some(ct) = content_type {
        b = b.header("Content-Type", ct);
    }
    b.body(body).map_err(|e| SyncError::Decode(format!("building request: {}", e)))
}

/// CRUD + watch for a single kind. Stateless apart from its configuration.
#[derive(Clone)]
pub struct KubeApi {
    resource: ApiResourceDef,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for KubeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeApi").field("resource", &self.resource).field("retry", &self.retry).finish()
    }
}

impl KubeApi {
    pub fn new(resource: ApiResourceDef, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { resource, transport, retry }
    }

    pub fn resource(&self) -> &ApiResourceDef {
        &self.resource
    }

    pub fn api_base(&self) -> String {
        self.resource.api_base()
    }

    /// Namespace argument only matters for namespaced kinds.
    fn scope<'a>(&self, namespace: Option<&'a str>) -> Option<&'a str> {
        if self.resource.namespaced { namespace } else { None }
    }

    /// Send with timeout + retry, returning the body text.
    async fn send<B>(&self, op: &str, what: &str, mut build_req: B) -> SyncResult<String>
    where
        B: FnMut() -> SyncResult<http::Request<Vec<u8>>>,
    {
        let t0 = Instant::now();
        let res = with_retry(&self.retry, op, || {
            let req = build_req();
            async move {
                let req = req?;
                match tokio::time::timeout(self.retry.request_timeout, self.transport.request(req)).await {
                    Ok(r) => r.map_err(|e| classify(e, what)),
                    Err(_) => Err(classify(TransportError::Timeout, what)),
                }
            }
        })
        .await;
        histogram!("kide_api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.to_string());
        res
    }

    /// Fill `kind`/`apiVersion` that list items usually omit.
    fn complete_item(&self, mut item: Value) -> Value {
        if let Some(obj) = item.as_object_mut() {
            obj.entry("kind").or_insert_with(|| Value::String(self.resource.kind.clone()));
            obj.entry("apiVersion").or_insert_with(|| Value::String(self.resource.api_version()));
        }
        item
    }

    fn parse_object(&self, text: &str) -> SyncResult<KubeObject> {
        let v: Value = serde_json::from_str(text).map_err(|e| SyncError::Decode(e.to_string()))?;
        KubeObject::from_value(self.complete_item(v))
    }

    /// List objects, optionally restricted to one namespace.
    pub async fn list(&self, namespace: Option<&str>, opts: &ListOptions) -> SyncResult<ObjectList> {
        let ns = self.scope(namespace);
        let what = format!("list {} in {}", self.resource.plural, ns.unwrap_or("(all)"));
        let mut pairs = Vec::new();
        if let Some(l) = &opts.label_selector {
            pairs.push(("labelSelector", l.clone()));
        }
        if let Some(f) = &opts.field_selector {
            pairs.push(("fieldSelector", f.clone()));
        }
        if let Some(limit) = opts.limit {
            pairs.push(("limit", limit.to_string()));
        }
        let uri = path_with_query(self.resource.collection_path(ns), &pairs);
        let t0 = Instant::now();
        let text = self.send("list", &what, || build(http::Method::GET, uri.clone(), Vec::new(), None)).await?;
        let v: Value = serde_json::from_str(&text).map_err(|e| SyncError::Decode(format!("{}: {}", what, e)))?;
        let resource_version = v
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(ResourceVersion::from)
            .unwrap_or_default();
        let raw_items = match v.get("items") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(SyncError::Decode(format!("{}: items is not an array", what))),
        };
        let mut items = Vec::with_capacity(raw_items.len());
        for raw in raw_items {
            match KubeObject::from_value(self.complete_item(raw)) {
                Ok(o) => items.push(o),
                Err(e) => warn!(kind = %self.resource.kind, error = %e, "skipping malformed list item"),
            }
        }
        info!(kind = %self.resource.kind, ns = %ns.unwrap_or("(all)"), items = items.len(), rv = %resource_version, took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(ObjectList { items, resource_version })
    }

    pub async fn get(&self, name: &str, namespace: Option<&str>) -> SyncResult<KubeObject> {
        validate_name(name)?;
        let ns = self.scope(namespace);
        let what = format!("get {} {}", self.resource.kind, name);
        let uri = self.resource.object_path(ns, name);
        let text = self.send("get", &what, || build(http::Method::GET, uri.clone(), Vec::new(), None)).await?;
        self.parse_object(&text)
    }

    pub async fn create<T: Serialize>(&self, namespace: Option<&str>, body: &T) -> SyncResult<KubeObject> {
        let ns = self.scope(namespace);
        let what = format!("create {}", self.resource.kind);
        let data = serde_json::to_vec(body).map_err(|e| SyncError::Decode(e.to_string()))?;
        let uri = self.resource.collection_path(ns);
        let text = self
            .send("create", &what, || build(http::Method::POST, uri.clone(), data.clone(), Some("application/json")))
            .await?;
        self.parse_object(&text)
    }

    /// Replace (PUT) the whole object; the body should carry `metadata.resourceVersion`.
    pub async fn update<T: Serialize>(&self, name: &str, namespace: Option<&str>, body: &T) -> SyncResult<KubeObject> {
        validate_name(name)?;
        let ns = self.scope(namespace);
        let what = format!("update {} {}", self.resource.kind, name);
        let data = serde_json::to_vec(body).map_err(|e| SyncError::Decode(e.to_string()))?;
        let uri = self.resource.object_path(ns, name);
        let text = self
            .send("update", &what, || build(http::Method::PUT, uri.clone(), data.clone(), Some("application/json")))
            .await?;
        self.parse_object(&text)
    }

    pub async fn patch(&self, name: &str, namespace: Option<&str>, patch: &PatchBody) -> SyncResult<KubeObject> {
        validate_name(name)?;
        let ns = self.scope(namespace);
        let what = format!("patch {} {}", self.resource.kind, name);
        let data = serde_json::to_vec(patch.body()).map_err(|e| SyncError::Decode(e.to_string()))?;
        let uri = self.resource.object_path(ns, name);
        let ct = patch.content_type();
        let text = self.send("patch", &what, || build(http::Method::PATCH, uri.clone(), data.clone(), Some(ct))).await?;
        self.parse_object(&text)
    }

    pub async fn delete(&self, name: &str, namespace: Option<&str>) -> SyncResult<()> {
        validate_name(name)?;
        let ns = self.scope(namespace);
        let what = format!("delete {} {}", self.resource.kind, name);
        let uri = self.resource.object_path(ns, name);
        self.send("delete", &what, || build(http::Method::DELETE, uri.clone(), Vec::new(), None)).await?;
        info!(kind = %self.resource.kind, name = %name, ns = %ns.unwrap_or("-"), "api: delete ok");
        Ok(())
    }

    /// Open a watch from `cursor`. Not retried: reconnect policy belongs to the caller.
    /// An expired cursor surfaces as [`SyncError::ResourceVersionExpired`], either here
    /// or as an item of the stream.
    pub async fn watch(&self, namespace: Option<&str>, cursor: &ResourceVersion, opts: &WatchOptions) -> SyncResult<ObjectStream> {
        let ns = self.scope(namespace);
        let what = format!("watch {} in {}", self.resource.plural, ns.unwrap_or("(all)"));
        let mut pairs = vec![("watch", "true".to_string()), ("timeoutSeconds", opts.timeout_secs.to_string())];
        if !cursor.is_empty() {
            pairs.push(("resourceVersion", cursor.to_string()));
        }
        if opts.bookmarks {
            pairs.push(("allowWatchBookmarks", "true".to_string()));
        }
        if let Some(l) = &opts.label_selector {
            pairs.push(("labelSelector", l.clone()));
        }
        if let Some(f) = &opts.field_selector {
            pairs.push(("fieldSelector", f.clone()));
        }
        let req = build(http::Method::GET, path_with_query(self.resource.collection_path(ns), &pairs), Vec::new(), None)?;
        let stream = match tokio::time::timeout(self.retry.request_timeout, self.transport.watch(req)).await {
            Ok(r) => r.map_err(|e| classify(e, &what))?,
            Err(_) => return Err(classify(TransportError::Timeout, &what)),
        };
        debug!(kind = %self.resource.kind, ns = %ns.unwrap_or("(all)"), rv = %cursor, "api: watch opened");
        let api = self.clone();
        Ok(stream.map(move |ev| api.watch_item(ev, &what)).boxed())
    }

    fn watch_item(&self, ev: Result<WatchEvent<Value>, TransportError>, what: &str) -> SyncResult<WatchItem> {
        match ev.map_err(|e| classify(e, what))? {
            WatchEvent::Added(v) => Ok(WatchItem::Added(KubeObject::from_value(self.complete_item(v))?)),
            WatchEvent::Modified(v) => Ok(WatchItem::Modified(KubeObject::from_value(self.complete_item(v))?)),
            WatchEvent::Deleted(v) => Ok(WatchItem::Deleted(KubeObject::from_value(self.complete_item(v))?)),
            WatchEvent::Bookmark(b) => Ok(WatchItem::Bookmark(ResourceVersion::from(b.metadata.resource_version))),
            WatchEvent::Error(resp) => Err(classify(TransportError::Status { code: resp.code, message: resp.message }, what)),
        }
    }
}
