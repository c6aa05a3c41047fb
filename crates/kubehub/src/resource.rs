//! Resource kind definitions and REST path building.

use serde::{Deserialize, Serialize};

/// A served resource kind and where it lives on the API server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ApiResourceDef {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Lowercase plural used in URLs (`pods`, `deployments`).
    pub plural: String,
    pub namespaced: bool,
}

impl ApiResourceDef {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    /// `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    fn prefix(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    /// Collection path across all namespaces, used as the registry key.
    pub fn api_base(&self) -> String {
        format!("{}/{}", self.prefix(), self.plural)
    }

    /// Collection path, namespace-scoped when the kind is namespaced and a namespace is given.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if self.namespaced => format!("{}/namespaces/{}/{}", self.prefix(), ns, self.plural),
            _ => self.api_base(),
        }
    }

    pub fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

/// Pieces of an API path as understood by [`parse_api_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPath {
    pub api_base: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Split a collection or object path into its api base, namespace and name.
///
/// Accepts `/api/v1/pods`, `/api/v1/namespaces/ns/pods/name`,
/// `/apis/apps/v1/namespaces/ns/deployments`, `/api/v1/namespaces/ns`
/// (the namespace object itself). Query strings are ignored.
pub fn parse_api_path(path: &str) -> Option<ApiPath> {
    let path = path.split('?').next().unwrap_or_default();
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let (prefix, rest) = match segs.as_slice() {
        ["api", version, rest @ ..] => (format!("/api/{}", version), rest),
        ["apis", group, version, rest @ ..] => (format!("/apis/{}/{}", group, version), rest),
        _ => return None,
    };
    let (namespace, resource, name) = match rest {
        ["namespaces", ns, resource, name] => (Some(ns.to_string()), *resource, Some(name.to_string())),
        ["namespaces", ns, resource] => (Some(ns.to_string()), *resource, None),
        ["namespaces", ns] => (None, "namespaces", Some(ns.to_string())),
        [resource, name] => (None, *resource, Some(name.to_string())),
        [resource] => (None, *resource, None),
        _ => return None,
    };
    Some(ApiPath { api_base: format!("{}/{}", prefix, resource), namespace, name })
}

/// Kinds every cluster serves.
pub fn builtin_resources() -> Vec<ApiResourceDef> {
    vec![
        ApiResourceDef::new("", "v1", "Pod", "pods", true),
        ApiResourceDef::new("", "v1", "ConfigMap", "configmaps", true),
        ApiResourceDef::new("", "v1", "Secret", "secrets", true),
        ApiResourceDef::new("", "v1", "Service", "services", true),
        ApiResourceDef::new("", "v1", "Namespace", "namespaces", false),
        ApiResourceDef::new("", "v1", "Node", "nodes", false),
        ApiResourceDef::new("apps", "v1", "Deployment", "deployments", true),
        ApiResourceDef::new("apps", "v1", "ReplicaSet", "replicasets", true),
        ApiResourceDef::new("apps", "v1", "StatefulSet", "statefulsets", true),
        ApiResourceDef::new("apps", "v1", "DaemonSet", "daemonsets", true),
        ApiResourceDef::new("batch", "v1", "Job", "jobs", true),
    ]
}
