//! Persistence backends
//!
//! Every backend implements [`StoreBackend`]. Web storage and cookie backends
//! are synchronous underneath and resolve immediately; the indexed backend
//! really suspends on its object store.

pub mod cookie;
pub mod indexed;
pub mod web;

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Value;

pub use cookie::{CookieAttributes, CookieBackend, CookieJar, MemoryCookieJar};
pub use indexed::{FileObjectStore, IndexedBackend, IndexedRecord, MemoryObjectStore, ObjectStore};
pub use web::{FileArea, MemoryArea, StorageArea, WebStorageBackend};

/// Prefix applied to every key before it reaches the underlying storage
pub const NAMESPACE: &str = "_ms_";

/// Tier marker written into session records
pub(crate) const SESSION_EXPIRY: i64 = -1;

/// Which backend variant to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Web-storage style session and durable tiers
    #[default]
    Store,
    Cookie,
    Indexed,
}

impl BackendKind {
    /// Lookup by name; anything unknown selects the web store
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "cookie" => BackendKind::Cookie,
            "indexed" => BackendKind::Indexed,
            _ => BackendKind::Store,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Store => "store",
            BackendKind::Cookie => "cookie",
            BackendKind::Indexed => "indexed",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability set shared by all persistence backends
///
/// `ttl` is in seconds: `None` writes session-scoped data, `Some(0)` is
/// rejected, a negative value never expires.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Logical keys of every record this backend holds
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove every namespaced record
    async fn clear(&self) -> Result<()>;

    /// Check whether a record exists
    async fn has(&self, key: &str) -> Result<bool>;

    /// Store a value; `Ok(false)` means the write was rejected
    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<i64>,
        attrs: Option<&CookieAttributes>,
    ) -> Result<bool>;

    /// Retrieve and decode a value
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Retrieve the raw encoded payload
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Remove a value; `Ok(false)` when nothing was stored
    async fn remove(&self, key: &str) -> Result<bool>;

    fn kind(&self) -> BackendKind;
}

/// Storage key for a logical key
pub fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}{}", urlencoding::encode(key))
}

/// Logical key for a storage key, `None` for keys outside the namespace
pub fn logical(raw: &str) -> Option<String> {
    let encoded = raw.strip_prefix(NAMESPACE)?;
    Some(
        urlencoding::decode(encoded)
            .map(Cow::into_owned)
            .unwrap_or_else(|_| encoded.to_string()),
    )
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expiry timestamp for a durable write, `None` when the ttl is rejected
///
/// Negative ttls are kept as-is and mean "never expires".
pub(crate) fn durable_expiry(ttl: i64) -> Option<i64> {
    match ttl {
        0 => None,
        t if t < 0 => Some(t),
        t => Some(now_millis().saturating_add(t.saturating_mul(1000))),
    }
}

pub(crate) fn is_expired(expires: i64) -> bool {
    expires >= 0 && expires < now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespacing_round_trip() {
        let raw = namespaced("intercache_user/1 a");
        assert!(raw.starts_with(NAMESPACE));
        assert!(!raw.contains(' '));
        assert_eq!(logical(&raw).as_deref(), Some("intercache_user/1 a"));
        assert_eq!(logical("other_key"), None);
    }

    #[test]
    fn test_backend_kind_falls_back_to_store() {
        assert_eq!(BackendKind::from_name("cookie"), BackendKind::Cookie);
        assert_eq!(BackendKind::from_name("INDEXED"), BackendKind::Indexed);
        assert_eq!(BackendKind::from_name("session"), BackendKind::Store);
        assert_eq!(BackendKind::from_name(""), BackendKind::Store);
    }

    #[test]
    fn test_durable_expiry() {
        assert_eq!(durable_expiry(0), None);
        assert_eq!(durable_expiry(-1), Some(-1));
        let expires = durable_expiry(10).unwrap();
        assert!(expires > now_millis() + 9_000);
        assert!(!is_expired(-1));
        assert!(is_expired(now_millis() - 1));
    }
}
