//! Web-storage style backend
//!
//! Two [`StorageArea`]s play the part of session and local storage. Session
//! records never expire; durable records carry a millisecond expiry that is
//! checked lazily on read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    durable_expiry, is_expired, logical, namespaced, BackendKind, CookieAttributes, StoreBackend,
    NAMESPACE, SESSION_EXPIRY,
};
use crate::codec::Codec;
use crate::error::{CacheError, Result};
use crate::value::{TypeTag, Value};

/// A string key-value area with the shape of the Web Storage API
pub trait StorageArea: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    fn remove_item(&self, key: &str) -> Result<()>;

    /// Every raw key in the area, namespaced or not
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-process area, dropped with the process
#[derive(Default)]
pub struct MemoryArea {
    items: RwLock<BTreeMap<String, String>>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageArea for MemoryArea {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.read().keys().cloned().collect())
    }
}

/// Area persisted as a single JSON document on disk
///
/// Every operation reads the file, so separate handles on the same path see
/// each other's writes. [`StorageArea`] is synchronous, so each call blocks
/// the calling thread on `std::fs` I/O, including when reached from the
/// async [`WebStorageBackend`] methods.
pub struct FileArea {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileArea {
    /// Open an area at `path`, creating the parent directory if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                fs::create_dir_all(parent)?;
                debug!("Created storage directory: {}", parent.display());
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| CacheError::Storage {
            message: format!("corrupt storage file {}: {}", self.path.display(), e),
        })
    }

    fn save(&self, items: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string(items)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageArea for FileArea {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut items = self.load()?;
        items.insert(key.to_string(), value.to_string());
        self.save(&items)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut items = self.load()?;
        if items.remove(key).is_some() {
            self.save(&items)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.into_keys().collect())
    }
}

/// `[expires, payload, tag]` as written to an area
type Record = (i64, String, TypeTag);

/// Backend over a session area and a durable area
pub struct WebStorageBackend {
    session: Arc<dyn StorageArea>,
    durable: Arc<dyn StorageArea>,
    codec: Codec,
}

impl WebStorageBackend {
    pub fn new(session: Arc<dyn StorageArea>, durable: Arc<dyn StorageArea>) -> Self {
        Self::with_codec(session, durable, Codec::new())
    }

    pub fn with_codec(
        session: Arc<dyn StorageArea>,
        durable: Arc<dyn StorageArea>,
        codec: Codec,
    ) -> Self {
        Self {
            session,
            durable,
            codec,
        }
    }

    fn parse(raw: &str) -> Result<Record> {
        serde_json::from_str(raw).map_err(|e| CacheError::deserialization(e.to_string()))
    }

    /// Live record for a storage key, purging an expired durable one
    fn record(&self, raw_key: &str) -> Result<Option<Record>> {
        if let Some(raw) = self.session.get_item(raw_key)? {
            return Self::parse(&raw).map(Some);
        }
        if let Some(raw) = self.durable.get_item(raw_key)? {
            let record = Self::parse(&raw)?;
            if is_expired(record.0) {
                debug!("Durable record expired: {}", raw_key);
                self.durable.remove_item(raw_key)?;
                return Ok(None);
            }
            return Ok(Some(record));
        }
        Ok(None)
    }
}

#[async_trait]
impl StoreBackend for WebStorageBackend {
    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .durable
            .keys()?
            .into_iter()
            .chain(self.session.keys()?)
            .filter_map(|raw| logical(&raw))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        for raw in self.durable.keys()? {
            if raw.starts_with(NAMESPACE) {
                self.durable.remove_item(&raw)?;
            }
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        // Ignores expiry, unlike `get`.
        let raw_key = namespaced(key);
        Ok(self.durable.get_item(&raw_key)?.is_some()
            || self.session.get_item(&raw_key)?.is_some())
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<i64>,
        _attrs: Option<&CookieAttributes>,
    ) -> Result<bool> {
        let raw_key = namespaced(key);
        let encoded = self.codec.encode(value);
        match ttl {
            None => {
                let record: Record = (SESSION_EXPIRY, encoded.payload, encoded.tag);
                self.session
                    .set_item(&raw_key, &serde_json::to_string(&record)?)?;
                self.durable.remove_item(&raw_key)?;
            }
            Some(ttl) => {
                let Some(expires) = durable_expiry(ttl) else {
                    return Ok(false);
                };
                let record: Record = (expires, encoded.payload, encoded.tag);
                self.durable
                    .set_item(&raw_key, &serde_json::to_string(&record)?)?;
                self.session.remove_item(&raw_key)?;
            }
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.record(&namespaced(key))? {
            Some((_, payload, tag)) => self.codec.decode(&payload, tag).map(Some),
            None => Ok(None),
        }
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.record(&namespaced(key))?.map(|(_, payload, _)| payload))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        if !self.has(key).await? {
            return Ok(false);
        }
        let raw_key = namespaced(key);
        self.durable.remove_item(&raw_key)?;
        self.session.remove_item(&raw_key)?;
        Ok(true)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Store
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    fn memory_backend() -> (WebStorageBackend, Arc<MemoryArea>, Arc<MemoryArea>) {
        let session = Arc::new(MemoryArea::new());
        let durable = Arc::new(MemoryArea::new());
        let backend = WebStorageBackend::new(session.clone(), durable.clone());
        (backend, session, durable)
    }

    #[tokio::test]
    async fn test_session_write_without_ttl() {
        let (backend, session, durable) = memory_backend();

        assert!(backend.set("k", &Value::from("v"), None, None).await.unwrap());
        assert_eq!(session.keys().unwrap(), vec![namespaced("k")]);
        assert!(durable.keys().unwrap().is_empty());

        let raw = session.get_item(&namespaced("k")).unwrap().unwrap();
        assert_eq!(raw, r#"[-1,"v","string"]"#);
        assert_eq!(backend.get("k").await.unwrap(), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let (backend, session, durable) = memory_backend();

        assert!(!backend.set("k", &Value::from(1), Some(0), None).await.unwrap());
        assert!(session.keys().unwrap().is_empty());
        assert!(durable.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negative_ttl_never_expires() {
        let (backend, _, durable) = memory_backend();

        backend.set("k", &Value::from(true), Some(-1), None).await.unwrap();
        let raw = durable.get_item(&namespaced("k")).unwrap().unwrap();
        assert!(raw.starts_with("[-1,"));
        assert_eq!(backend.get("k").await.unwrap(), Some(Value::from(true)));
    }

    #[tokio::test]
    async fn test_durable_record_expires_lazily() {
        let (backend, _, durable) = memory_backend();

        backend.set("k", &Value::from("soon"), Some(1), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(Value::from("soon")));
        assert_eq!(backend.get_string("k").await.unwrap().as_deref(), Some("soon"));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Still physically present until the next read
        assert!(backend.has("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(durable.get_item(&namespaced("k")).unwrap().is_none());
        assert!(!backend.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_tier_wins_on_read() {
        let (backend, session, durable) = memory_backend();
        let record: Record = (SESSION_EXPIRY, "session".into(), TypeTag::String);
        session
            .set_item(&namespaced("k"), &serde_json::to_string(&record).unwrap())
            .unwrap();
        let record: Record = (-1, "durable".into(), TypeTag::String);
        durable
            .set_item(&namespaced("k"), &serde_json::to_string(&record).unwrap())
            .unwrap();

        assert_eq!(backend.get("k").await.unwrap(), Some(Value::from("session")));
    }

    #[tokio::test]
    async fn test_keys_clear_and_remove() {
        let (backend, _, durable) = memory_backend();
        durable.set_item("foreign", "untouched").unwrap();

        backend.set("a b", &Value::from(1), Some(-1), None).await.unwrap();
        backend.set("c", &Value::from(2), None, None).await.unwrap();
        assert_eq!(backend.keys().await.unwrap(), vec!["a b".to_string(), "c".to_string()]);

        assert!(backend.remove("c").await.unwrap());
        assert!(!backend.remove("c").await.unwrap());

        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
        assert_eq!(durable.get_item("foreign").unwrap().as_deref(), Some("untouched"));
    }

    #[tokio::test]
    async fn test_malformed_record_fails_to_decode() {
        let (backend, _, durable) = memory_backend();
        durable.set_item(&namespaced("bad"), "not a record").unwrap();
        assert!(matches!(
            backend.get("bad").await,
            Err(CacheError::Deserialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_area_is_shared_between_handles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("local.json");

        let first = WebStorageBackend::new(
            Arc::new(MemoryArea::new()),
            Arc::new(FileArea::open(&path).unwrap()),
        );
        first
            .set("user", &Value::Json(serde_json::json!({"id": 7})), Some(-1), None)
            .await
            .unwrap();

        let second = WebStorageBackend::new(
            Arc::new(MemoryArea::new()),
            Arc::new(FileArea::open(&path).unwrap()),
        );
        assert_eq!(
            second.get("user").await.unwrap(),
            Some(Value::Json(serde_json::json!({"id": 7})))
        );
    }

    #[tokio::test]
    async fn test_unavailable_area_reports_errors() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();

        let area = FileArea::open(blocker.join("local.json"));
        assert!(area.is_err());
    }
}
