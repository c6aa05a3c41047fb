//! Kind-based dispatch from a generic [`KubeObject`] to a typed resource.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Secret, Service};
use serde::de::DeserializeOwned;

use crate::{KubeObject, SyncError, SyncResult};

/// A decoded object, one variant per built-in kind.
#[derive(Debug, Clone)]
pub enum TypedObject {
    Pod(Box<Pod>),
    ConfigMap(Box<ConfigMap>),
    Secret(Box<Secret>),
    Service(Box<Service>),
    Namespace(Box<Namespace>),
    Node(Box<Node>),
    Deployment(Box<Deployment>),
    ReplicaSet(Box<ReplicaSet>),
    StatefulSet(Box<StatefulSet>),
    DaemonSet(Box<DaemonSet>),
    Job(Box<Job>),
    /// Kind without a registered decoder.
    Generic(KubeObject),
}

fn ready_of(ready: Option<i32>, desired: Option<i32>) -> String {
    format!("{}/{}", ready.unwrap_or(0), desired.unwrap_or(0))
}

impl TypedObject {
    /// Short status line for list views.
    pub fn summary(&self) -> String {
        match self {
            TypedObject::Pod(p) => {
                let status = p.status.as_ref();
                let phase = status.and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".into());
                let restarts: i32 = status
                    .and_then(|s| s.container_statuses.as_ref())
                    .map(|cs| cs.iter().map(|c| c.restart_count).sum())
                    .unwrap_or(0);
                if restarts > 0 { format!("{} (restarts {})", phase, restarts) } else { phase }
            }
            TypedObject::ConfigMap(c) => {
                let keys = c.data.as_ref().map_or(0, |d| d.len()) + c.binary_data.as_ref().map_or(0, |d| d.len());
                format!("{} keys", keys)
            }
            TypedObject::Secret(s) => {
                let keys = s.data.as_ref().map_or(0, |d| d.len());
                format!("{} ({} keys)", s.type_.as_deref().unwrap_or("Opaque"), keys)
            }
            TypedObject::Service(s) => {
                let spec = s.spec.as_ref();
                let ty = spec.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP");
                let ip = spec.and_then(|s| s.cluster_ip.as_deref()).unwrap_or("-");
                format!("{} {}", ty, ip)
            }
            TypedObject::Namespace(n) => n.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_else(|| "Active".into()),
            TypedObject::Node(n) => {
                let ready = n
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
                    .map(|c| c.status == "True")
                    .unwrap_or(false);
                if ready { "Ready".into() } else { "NotReady".into() }
            }
            TypedObject::Deployment(d) => {
                ready_of(d.status.as_ref().and_then(|s| s.ready_replicas), d.spec.as_ref().and_then(|s| s.replicas))
            }
            TypedObject::ReplicaSet(r) => {
                ready_of(r.status.as_ref().and_then(|s| s.ready_replicas), r.spec.as_ref().and_then(|s| s.replicas))
            }
            TypedObject::StatefulSet(s) => {
                ready_of(s.status.as_ref().and_then(|s| s.ready_replicas), s.spec.as_ref().and_then(|s| s.replicas))
            }
            TypedObject::DaemonSet(d) => {
                let status = d.status.as_ref();
                ready_of(status.map(|s| s.number_ready), status.map(|s| s.desired_number_scheduled))
            }
            TypedObject::Job(j) => {
                ready_of(j.status.as_ref().and_then(|s| s.succeeded), j.spec.as_ref().and_then(|s| s.completions))
            }
            TypedObject::Generic(_) => String::new(),
        }
    }
}

pub type DecodeFn = fn(&KubeObject) -> SyncResult<TypedObject>;

fn decode_as<K: DeserializeOwned>(obj: &KubeObject) -> SyncResult<K> {
    serde_json::from_value(obj.raw().clone()).map_err(|e| SyncError::malformed(format!("{} body ({})", obj.kind(), e)))
}

/// Registry of constructors keyed by `kind`.
#[derive(Clone, Default)]
pub struct KindRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind.
    pub fn builtin() -> Self {
        let entries: [(&str, DecodeFn); 11] = [
            ("Pod", |o| Ok(TypedObject::Pod(Box::new(decode_as(o)?)))),
            ("ConfigMap", |o| Ok(TypedObject::ConfigMap(Box::new(decode_as(o)?)))),
            ("Secret", |o| Ok(TypedObject::Secret(Box::new(decode_as(o)?)))),
            ("Service", |o| Ok(TypedObject::Service(Box::new(decode_as(o)?)))),
            ("Namespace", |o| Ok(TypedObject::Namespace(Box::new(decode_as(o)?)))),
            ("Node", |o| Ok(TypedObject::Node(Box::new(decode_as(o)?)))),
            ("Deployment", |o| Ok(TypedObject::Deployment(Box::new(decode_as(o)?)))),
            ("ReplicaSet", |o| Ok(TypedObject::ReplicaSet(Box::new(decode_as(o)?)))),
            ("StatefulSet", |o| Ok(TypedObject::StatefulSet(Box::new(decode_as(o)?)))),
            ("DaemonSet", |o| Ok(TypedObject::DaemonSet(Box::new(decode_as(o)?)))),
            ("Job", |o| Ok(TypedObject::Job(Box::new(decode_as(o)?)))),
        ];
        let decoders = entries.into_iter().map(|(k, f)| (k.to_string(), f)).collect();
        Self { decoders }
    }

    /// Add a decoder. A kind can only be registered once.
    pub fn register(&mut self, kind: &str, decode: DecodeFn) -> SyncResult<()> {
        if self.decoders.contains_key(kind) {
            return Err(SyncError::DuplicateRegistration(format!("decoder for kind {}", kind)));
        }
        self.decoders.insert(kind.to_string(), decode);
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Decode by kind; unregistered kinds come back as [`TypedObject::Generic`].
    pub fn decode(&self, obj: &KubeObject) -> SyncResult<TypedObject> {
        match self.decoders.get(obj.kind()) {
            Some(f) => f(obj),
            None => Ok(TypedObject::Generic(obj.clone())),
        }
    }
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds().collect();
        kinds.sort_unstable();
        f.debug_struct("KindRegistry").field("kinds", &kinds).finish()
    }
}
