//! kide core types: object model, kind registry and the error taxonomy
//! shared by the client, store and watch layers.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod kinds;
pub mod object;
pub mod version;

pub use error::{SyncError, SyncResult};
pub use kinds::{KindRegistry, TypedObject};
pub use object::{format_age, KubeObject, ObjectOrder};
pub use version::ResourceVersion;

/// Kubernetes object uid, keyed from `metadata.uid`.
///
/// The API server hands out UUIDs. Anything else (fixtures, aggregated APIs)
/// is keyed by a name-based UUID of the raw string, so `Display` shows the
/// derived form for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub [u8; 16]);

impl Uid {
    /// Strict parse: only UUIDs.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Uid(*u.as_bytes()))
    }

    /// Key for any non-empty `metadata.uid`.
    pub fn from_meta(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        Some(Self::parse(s).unwrap_or_else(|| Uid(*uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, s.as_bytes()).as_bytes())))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&uuid::Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

pub mod prelude {
    pub use super::{
        EventType, KindRegistry, KubeObject, ObjectOrder, ResourceVersion, SyncError, SyncResult,
        TypedObject, Uid,
    };
}
