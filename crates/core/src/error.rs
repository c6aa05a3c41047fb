use serde::{Deserialize, Serialize};

/// Errors raised by the synchronization layer.
///
/// Variants are plain data so a store can keep them around for display
/// (e.g. the per-namespace load error list).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("malformed object: missing or invalid {field}")]
    MalformedObject { field: String },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource version expired: {0}")]
    ResourceVersionExpired(String),
    #[error("transient fetch error after {attempts} attempt(s): {message}")]
    TransientFetch { attempts: u32, message: String },
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("store detached")]
    Detached,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn malformed(field: impl Into<String>) -> Self {
        SyncError::MalformedObject { field: field.into() }
    }

    /// Transient network/timeout errors are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientFetch { .. })
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, SyncError::ResourceVersionExpired(_))
    }

    /// Short machine-readable tag, used as a metrics label.
    pub fn tag(&self) -> &'static str {
        match self {
            SyncError::MalformedObject { .. } => "malformed",
            SyncError::AccessDenied(_) => "access_denied",
            SyncError::NotFound(_) => "not_found",
            SyncError::ResourceVersionExpired(_) => "expired",
            SyncError::TransientFetch { .. } => "transient",
            SyncError::InconsistentState(_) => "inconsistent",
            SyncError::InvalidName(_) => "invalid_name",
            SyncError::DuplicateRegistration(_) => "duplicate",
            SyncError::Api { .. } => "api",
            SyncError::Decode(_) => "decode",
            SyncError::Detached => "detached",
        }
    }
}
