//! Scripted in-memory [`Transport`] for tests.
//!
//! Responses are keyed by `METHOD path` (query string ignored). Queued
//! responses are served first, then the sticky one if set. Watches are
//! served from a per-path queue; with nothing queued a watch stays open and
//! silent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use futures::channel::mpsc;
use futures::StreamExt;
use kube::core::WatchEvent;
use serde_json::Value;

use crate::transport::{Transport, TransportError, WatchStream};

pub type WatchFrame = Result<WatchEvent<Value>, TransportError>;

/// What the next watch on a path returns.
pub enum WatchReply {
    /// The watch request itself fails.
    Fail(TransportError),
    /// These frames, then the stream stays open.
    Frames(Vec<WatchFrame>),
    /// These frames, then the stream ends.
    FramesThenClose(Vec<WatchFrame>),
    /// Frames pushed by the test through the paired sender.
    Channel(mpsc::UnboundedReceiver<WatchFrame>),
}

#[derive(Default)]
struct Routes {
    queued: HashMap<String, VecDeque<Result<Value, TransportError>>>,
    sticky: HashMap<String, Result<Value, TransportError>>,
    watches: HashMap<String, VecDeque<WatchReply>>,
    log: Vec<String>,
}

#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Routes>,
}

fn route_key(method: &str, path: &str) -> String {
    format!("{} {}", method, path.split('?').next().unwrap_or_default())
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Serve `reply` for every matching request not covered by a queued reply.
    pub fn respond(&self, method: &str, path: &str, reply: Result<Value, TransportError>) {
        self.routes().sticky.insert(route_key(method, path), reply);
    }

    /// Serve `reply` once, before any sticky reply.
    pub fn respond_once(&self, method: &str, path: &str, reply: Result<Value, TransportError>) {
        self.routes().queued.entry(route_key(method, path)).or_default().push_back(reply);
    }

    pub fn script_watch(&self, path: &str, reply: WatchReply) {
        self.routes().watches.entry(route_key("WATCH", path)).or_default().push_back(reply);
    }

    /// Queue a channel-backed watch and return its sender.
    pub fn watch_channel(&self, path: &str) -> mpsc::UnboundedSender<WatchFrame> {
        let (tx, rx) = mpsc::unbounded();
        self.script_watch(path, WatchReply::Channel(rx));
        tx
    }

    /// Every request seen so far as `METHOD uri` (watches as `WATCH uri`).
    pub fn requests(&self) -> Vec<String> {
        self.routes().log.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.routes().log.iter().filter(|l| l.starts_with(prefix)).count()
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn request(&self, req: http::Request<Vec<u8>>) -> Result<String, TransportError> {
        let uri = req.uri().to_string();
        let key = route_key(req.method().as_str(), &uri);
        let mut routes = self.routes();
        routes.log.push(format!("{} {}", req.method(), uri));
        let reply = match routes.queued.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(r) => r,
            None => routes
                .sticky
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Status { code: 404, message: format!("no route for {}", key) })),
        };
        reply.map(|v| v.to_string())
    }

    async fn watch(&self, req: http::Request<Vec<u8>>) -> Result<WatchStream, TransportError> {
        let uri = req.uri().to_string();
        let key = route_key("WATCH", &uri);
        let next = {
            let mut routes = self.routes();
            routes.log.push(format!("WATCH {}", uri));
            routes.watches.get_mut(&key).and_then(VecDeque::pop_front)
        };
        match next {
            None => Ok(futures::stream::pending().boxed()),
            Some(WatchReply::Fail(e)) => Err(e),
            Some(WatchReply::Frames(frames)) => Ok(futures::stream::iter(frames).chain(futures::stream::pending()).boxed()),
            Some(WatchReply::FramesThenClose(frames)) => Ok(futures::stream::iter(frames).boxed()),
            Some(WatchReply::Channel(rx)) => Ok(rx.boxed()),
        }
    }
}
