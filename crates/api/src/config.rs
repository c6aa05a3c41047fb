//! Runtime tuning for the sync core, read from `KIDE_*` environment variables.

use std::time::Duration;

use kide_kubehub::{BackoffPolicy, RetryPolicy, WatchOptions};
use kide_store::StoreOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_min_ms: u64,
    pub retry_max_ms: u64,
    pub watch_backoff_min_ms: u64,
    pub watch_backoff_max_ms: u64,
    /// Server-side watch timeout; the stream is reopened from its cursor after it.
    pub watch_timeout_secs: u32,
    pub watch_bookmarks: bool,
    pub tombstone_capacity: usize,
    /// Initial namespace selection; empty means all namespaces.
    pub namespaces: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let backoff = BackoffPolicy::default();
        let watch = WatchOptions::default();
        Self {
            request_timeout_ms: retry.request_timeout.as_millis() as u64,
            retry_attempts: retry.max_attempts,
            retry_min_ms: retry.min_delay.as_millis() as u64,
            retry_max_ms: retry.max_delay.as_millis() as u64,
            watch_backoff_min_ms: backoff.min_delay.as_millis() as u64,
            watch_backoff_max_ms: backoff.max_delay.as_millis() as u64,
            watch_timeout_secs: watch.timeout_secs,
            watch_bookmarks: watch.bookmarks,
            tombstone_capacity: StoreOptions::default().tombstone_capacity,
            namespaces: Vec::new(),
        }
    }
}

fn flag(v: &str) -> Option<bool> {
    match v.trim() {
        "1" => Some(true),
        "0" => Some(false),
        s if s.eq_ignore_ascii_case("true") => Some(true),
        s if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source. Unset or unparsable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let num = |k: &str, dflt: u64| lookup(k).and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(dflt);
        Self {
            request_timeout_ms: num("KIDE_REQUEST_TIMEOUT_MS", d.request_timeout_ms),
            retry_attempts: num("KIDE_RETRY_ATTEMPTS", d.retry_attempts as u64).clamp(1, u32::MAX as u64) as u32,
            retry_min_ms: num("KIDE_RETRY_MIN_MS", d.retry_min_ms),
            retry_max_ms: num("KIDE_RETRY_MAX_MS", d.retry_max_ms),
            watch_backoff_min_ms: num("KIDE_WATCH_BACKOFF_MIN_MS", d.watch_backoff_min_ms),
            watch_backoff_max_ms: num("KIDE_WATCH_BACKOFF_MAX_MS", d.watch_backoff_max_ms),
            watch_timeout_secs: num("KIDE_WATCH_TIMEOUT_SECS", d.watch_timeout_secs as u64).min(u32::MAX as u64) as u32,
            watch_bookmarks: lookup("KIDE_WATCH_BOOKMARKS").as_deref().and_then(flag).unwrap_or(d.watch_bookmarks),
            tombstone_capacity: num("KIDE_TOMBSTONES", d.tombstone_capacity as u64) as usize,
            namespaces: lookup("KIDE_NAMESPACES")
                .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or(d.namespaces),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            min_delay: Duration::from_millis(self.retry_min_ms),
            max_delay: Duration::from_millis(self.retry_max_ms.max(self.retry_min_ms)),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            min_delay: Duration::from_millis(self.watch_backoff_min_ms),
            max_delay: Duration::from_millis(self.watch_backoff_max_ms.max(self.watch_backoff_min_ms)),
        }
    }

    pub fn watch(&self) -> WatchOptions {
        WatchOptions { timeout_secs: self.watch_timeout_secs, bookmarks: self.watch_bookmarks, ..WatchOptions::default() }
    }

    pub fn store(&self) -> StoreOptions {
        StoreOptions { tombstone_capacity: self.tombstone_capacity, ..StoreOptions::default() }
    }
}
