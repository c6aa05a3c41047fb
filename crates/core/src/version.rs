use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque server-assigned resource version.
///
/// Versions are compared numerically when both sides parse as `u64`.
/// Anything else is incomparable and callers treat the incoming payload as
/// authoritative. Lexical comparison is never used ("10" < "9" lexically).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse::<u64>().ok()
    }

    /// Numeric comparison, `None` when either side is not a number.
    pub fn compare(&self, other: &ResourceVersion) -> Option<Ordering> {
        Some(self.numeric()?.cmp(&other.numeric()?))
    }

    /// True only when `self` is provably older than `other`.
    pub fn is_older_than(&self, other: &ResourceVersion) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// True when `self` is provably older than or equal to `other`.
    pub fn is_at_most(&self, other: &ResourceVersion) -> bool {
        matches!(self.compare(other), Some(Ordering::Less | Ordering::Equal))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self {
        Self(v)
    }
}
