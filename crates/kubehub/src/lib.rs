//! kide kubehub: resource definitions, REST client and discovery.

#![forbid(unsafe_code)]

use anyhow::Result;
use kube::discovery::{Discovery, Scope};
use tracing::info;

pub mod api;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod resource;
pub mod retry;
pub mod transport;

pub use api::{KubeApi, ListOptions, ObjectList, ObjectStream, PatchBody, WatchItem, WatchOptions};
pub use resource::{builtin_resources, parse_api_path, ApiPath, ApiResourceDef};
pub use retry::{Backoff, BackoffPolicy, RetryPolicy};
pub use transport::{KubeClientTransport, Transport, TransportError, WatchStream};

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover_resources(client: kube::Client) -> Result<Vec<ApiResourceDef>> {
    let t0 = std::time::Instant::now();
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(ApiResourceDef {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "discovery ok");
    Ok(out)
}
