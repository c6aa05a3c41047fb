//! The seam between the REST client and the wire.

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::core::WatchEvent;
use serde_json::Value;
use tracing::debug;

/// Failure reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("connection: {0}")]
    Connect(String),
    #[error("timed out")]
    Timeout,
    #[error("decode: {0}")]
    Decode(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent<Value>, TransportError>>;

/// Executes requests built by [`crate::KubeApi`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// One-shot request returning the response body.
    async fn request(&self, req: http::Request<Vec<u8>>) -> Result<String, TransportError>;

    /// Long-lived watch request returning decoded events.
    async fn watch(&self, req: http::Request<Vec<u8>>) -> Result<WatchStream, TransportError>;
}

/// [`Transport`] over a `kube::Client` (kubeconfig or in-cluster credentials).
#[derive(Clone)]
pub struct KubeClientTransport {
    client: kube::Client,
}

impl KubeClientTransport {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(kube::Client::try_default().await?))
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}

fn map_kube_err(e: kube::Error) -> TransportError {
    match e {
        kube::Error::Api(resp) => TransportError::Status { code: resp.code, message: resp.message },
        kube::Error::SerdeError(e) => TransportError::Decode(e.to_string()),
        kube::Error::FromUtf8(e) => TransportError::Decode(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}

#[async_trait::async_trait]
impl Transport for KubeClientTransport {
    async fn request(&self, req: http::Request<Vec<u8>>) -> Result<String, TransportError> {
        debug!(method = %req.method(), uri = %req.uri(), "transport: request");
        self.client.request_text(req).await.map_err(map_kube_err)
    }

    async fn watch(&self, req: http::Request<Vec<u8>>) -> Result<WatchStream, TransportError> {
        debug!(uri = %req.uri(), "transport: watch");
        let stream = self.client.request_events::<Value>(req).await.map_err(map_kube_err)?;
        Ok(stream.map(|r| r.map_err(map_kube_err)).boxed())
    }
}
