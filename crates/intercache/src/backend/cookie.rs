//! Cookie backend
//!
//! Records live in a [`CookieJar`] as `name=value` pairs. The value is the
//! percent-encoded JSON array `[payload, tag, path?, domain?]` so that a
//! removal can rebuild the scope the cookie was written with.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{logical, namespaced, BackendKind, StoreBackend, NAMESPACE};
use crate::codec::Codec;
use crate::error::{CacheError, Result};
use crate::value::{TypeTag, Value};

/// Lifetime written for cookies that should never expire
const UNBOUNDED_TTL_SECS: u64 = 2_147_483_647;

/// Optional scope attributes of a cookie write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieAttributes {
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
}

impl CookieAttributes {
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.domain.is_none() && !self.secure
    }
}

/// A cookie store with `document.cookie` semantics
pub trait CookieJar: Send + Sync {
    /// All live cookies as `name=value` pairs joined by `; `
    fn cookie_header(&self) -> String;

    /// Apply one `Set-Cookie` style string
    fn set_cookie(&self, cookie: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredCookie {
    name: String,
    value: String,
    expires: Option<SystemTime>,
    path: Option<String>,
    domain: Option<String>,
}

impl StoredCookie {
    fn parse(cookie: &str) -> Result<Self> {
        let mut parts = cookie.split(';');
        let pair = parts.next().unwrap_or_default();
        let (name, value) = pair.split_once('=').ok_or_else(|| CacheError::InvalidKey {
            key: pair.to_string(),
        })?;

        let mut stored = StoredCookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            expires: None,
            path: None,
            domain: None,
        };
        if stored.name.is_empty() {
            return Err(CacheError::InvalidKey {
                key: cookie.to_string(),
            });
        }

        for attr in parts {
            let (attr, value) = match attr.split_once('=') {
                Some((a, v)) => (a.trim().to_ascii_lowercase(), v.trim()),
                None => (attr.trim().to_ascii_lowercase(), ""),
            };
            match attr.as_str() {
                "expires" => stored.expires = httpdate::parse_http_date(value).ok(),
                "max-age" => {
                    if let Ok(secs) = value.parse::<i64>() {
                        stored.expires = Some(if secs <= 0 {
                            UNIX_EPOCH
                        } else {
                            SystemTime::now() + Duration::from_secs(secs as u64)
                        });
                    }
                }
                "path" => stored.path = Some(value.to_string()),
                "domain" => stored.domain = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(stored)
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn same_scope(&self, other: &StoredCookie) -> bool {
        self.name == other.name && self.path == other.path && self.domain == other.domain
    }
}

/// In-process cookie jar that expires cookies the way a browser does
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cookies, across all scopes
    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        self.cookies
            .lock()
            .iter()
            .filter(|c| !c.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CookieJar for MemoryCookieJar {
    fn cookie_header(&self) -> String {
        let now = SystemTime::now();
        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !c.is_expired(now));
        cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn set_cookie(&self, cookie: &str) -> Result<()> {
        let stored = StoredCookie::parse(cookie)?;
        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !c.same_scope(&stored));
        if !stored.is_expired(SystemTime::now()) {
            cookies.push(stored);
        }
        Ok(())
    }
}

/// Backend storing records as cookies
pub struct CookieBackend {
    jar: Arc<dyn CookieJar>,
    codec: Codec,
}

impl CookieBackend {
    pub fn new(jar: Arc<dyn CookieJar>) -> Self {
        Self::with_codec(jar, Codec::new())
    }

    pub fn with_codec(jar: Arc<dyn CookieJar>, codec: Codec) -> Self {
        Self { jar, codec }
    }

    /// Raw cookie value for a storage key
    fn lookup(&self, raw_key: &str) -> Result<Option<String>> {
        let pattern = Regex::new(&format!(
            r"(?:^|;)\s*{}\s*=\s*([^;]*)",
            regex::escape(raw_key)
        ))?;
        let header = self.jar.cookie_header();
        Ok(pattern
            .captures(&header)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    /// Decoded `[payload, tag, path?, domain?]` record
    fn record(&self, raw_key: &str) -> Result<Option<Vec<String>>> {
        let Some(raw) = self.lookup(raw_key)? else {
            return Ok(None);
        };
        let json = urlencoding::decode(&raw).map_err(|e| CacheError::deserialization(e.to_string()))?;
        let record: Vec<String> =
            serde_json::from_str(&json).map_err(|e| CacheError::deserialization(e.to_string()))?;
        if record.len() < 2 {
            return Err(CacheError::deserialization(format!(
                "cookie record for {raw_key} is missing its type tag"
            )));
        }
        Ok(Some(record))
    }
}

fn cookie_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

#[async_trait]
impl StoreBackend for CookieBackend {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .jar
            .cookie_header()
            .split(';')
            .filter_map(|pair| pair.split_once('=').map(|(name, _)| name.trim()))
            .filter(|name| name.starts_with(NAMESPACE))
            .filter_map(logical)
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(&namespaced(key))?.is_some())
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<i64>,
        attrs: Option<&CookieAttributes>,
    ) -> Result<bool> {
        if ttl == Some(0) || key.is_empty() {
            return Ok(false);
        }
        let raw_key = namespaced(key);
        let encoded = self.codec.encode(value);
        let attrs = attrs.cloned().unwrap_or_default();

        let mut record = vec![encoded.payload, encoded.tag.as_str().to_string()];
        if attrs.path.is_some() || attrs.domain.is_some() {
            record.push(attrs.path.clone().unwrap_or_default());
        }
        if let Some(domain) = &attrs.domain {
            record.push(domain.clone());
        }

        let mut cookie = format!(
            "{}={}",
            raw_key,
            urlencoding::encode(&serde_json::to_string(&record)?)
        );
        if let Some(ttl) = ttl {
            let secs = if ttl < 0 {
                UNBOUNDED_TTL_SECS
            } else {
                (ttl as u64).min(UNBOUNDED_TTL_SECS)
            };
            let expires = SystemTime::now() + Duration::from_secs(secs);
            cookie.push_str(&format!(";expires={}", cookie_date(expires)));
        }
        if let Some(path) = &attrs.path {
            cookie.push_str(&format!(";path={path}"));
        }
        if let Some(domain) = &attrs.domain {
            cookie.push_str(&format!(";domain={domain}"));
        }
        if attrs.secure {
            cookie.push_str(";secure");
        }

        debug!("Writing cookie record: {}", raw_key);
        self.jar.set_cookie(&cookie)?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.record(&namespaced(key))? {
            Some(record) => {
                let tag: TypeTag = record[1].parse()?;
                self.codec.decode(&record[0], tag).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .record(&namespaced(key))?
            .map(|mut record| record.swap_remove(0)))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let raw_key = namespaced(key);
        let Some(record) = self.record(&raw_key)? else {
            return Ok(false);
        };

        // The deletion must carry the original path and domain to match.
        let mut cookie = format!("{}=;expires={}", raw_key, cookie_date(UNIX_EPOCH));
        if let Some(path) = record.get(2).filter(|p| !p.is_empty()) {
            cookie.push_str(&format!(";path={path}"));
        }
        if let Some(domain) = record.get(3).filter(|d| !d.is_empty()) {
            cookie.push_str(&format!(";domain={domain}"));
        }
        self.jar.set_cookie(&cookie)?;
        Ok(true)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cookie
    }
}
