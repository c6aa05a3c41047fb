//! Typed wrapper over a raw Kubernetes JSON resource.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::Value;

use crate::{ResourceVersion, SyncError, SyncResult, Uid};

/// Immutable snapshot of one version of a cluster object.
///
/// A new instance is built for every delivered version; nothing here
/// mutates in place. Equality and hashing go by uid only.
#[derive(Debug, Clone)]
pub struct KubeObject {
    kind: String,
    api_version: String,
    uid: Uid,
    resource_version: ResourceVersion,
    metadata: ObjectMeta,
    raw: Arc<Value>,
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
}

impl KubeObject {
    /// Build from one JSON document. `kind`, `metadata.uid` and
    /// `metadata.resourceVersion` are required.
    #[allow(unused_mut)]
    pub fn from_value(mut raw: Value) -> SyncResult<Self> {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);

        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::malformed("kind"))?
            .to_string();
        let api_version = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let meta = raw.get("metadata").filter(|m| m.is_object()).ok_or_else(|| SyncError::malformed("metadata"))?;
        let metadata: ObjectMeta =
            serde_json::from_value(meta.clone()).map_err(|e| SyncError::malformed(format!("metadata ({})", e)))?;
        let uid = metadata
            .uid
            .as_deref()
            .and_then(Uid::from_meta)
            .ok_or_else(|| SyncError::malformed("metadata.uid"))?;
        let resource_version = metadata
            .resource_version
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(ResourceVersion::from)
            .ok_or_else(|| SyncError::malformed("metadata.resourceVersion"))?;
        Ok(Self { kind, api_version, uid, resource_version, metadata, raw: Arc::new(raw) })
    }

    pub fn from_json(text: &str) -> SyncResult<Self> {
        let v: Value = serde_json::from_str(text).map_err(|e| SyncError::Decode(e.to_string()))?;
        Self::from_value(v)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn is_namespaced(&self) -> bool {
        self.metadata.namespace.is_some()
    }

    /// Store key of this object.
    pub fn id(&self) -> Uid {
        self.uid
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn resource_version(&self) -> &ResourceVersion {
        &self.resource_version
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.creation_timestamp().map(|ts| now.signed_duration_since(ts))
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.annotations.as_ref().unwrap_or(&EMPTY)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }

    /// Labels rendered as `key=value`.
    pub fn label_strings(&self) -> Vec<String> {
        self.labels().iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// True when every `(key, value)` of `selector` is present.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        let labels = self.labels();
        selector.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references.as_deref().unwrap_or_default()
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    pub fn spec(&self) -> Option<&Value> {
        self.raw.get("spec")
    }

    pub fn status(&self) -> Option<&Value> {
        self.raw.get("status")
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// New instance with `metadata.labels[key] = value`.
    pub fn with_label(&self, key: &str, value: &str) -> SyncResult<Self> {
        self.with_metadata_entry("labels", key, value)
    }

    /// New instance with `metadata.annotations[key] = value`.
    pub fn with_annotation(&self, key: &str, value: &str) -> SyncResult<Self> {
        self.with_metadata_entry("annotations", key, value)
    }

    fn with_metadata_entry(&self, section: &str, key: &str, value: &str) -> SyncResult<Self> {
        let mut raw = (*self.raw).clone();
        let meta = raw
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| SyncError::malformed("metadata"))?;
        let entry = meta.entry(section).or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        if let Some(map) = entry.as_object_mut() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        Self::from_value(raw)
    }
}

impl PartialEq for KubeObject {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for KubeObject {}

impl Hash for KubeObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

/// Caller-selected list ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectOrder {
    /// Namespace, then name (uid breaks ties).
    #[default]
    Name,
    CreationAsc,
    CreationDesc,
}

impl ObjectOrder {
    pub fn compare(&self, a: &KubeObject, b: &KubeObject) -> Ordering {
        let by_name = || {
            a.namespace()
                .cmp(&b.namespace())
                .then_with(|| a.name().cmp(b.name()))
                .then_with(|| a.uid.cmp(&b.uid))
        };
        match self {
            ObjectOrder::Name => by_name(),
            ObjectOrder::CreationAsc => a.creation_timestamp().cmp(&b.creation_timestamp()).then_with(by_name),
            ObjectOrder::CreationDesc => b.creation_timestamp().cmp(&a.creation_timestamp()).then_with(by_name),
        }
    }
}

/// Compact age like `45s`, `12m`, `5h`, `3d`.
pub fn format_age(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
