//! Store facade
//!
//! Holds the one active backend and hands out new backends by kind. The
//! indexed backend is opened at most once per facade and shared afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::backend::{
    BackendKind, CookieAttributes, CookieBackend, CookieJar, FileArea, IndexedBackend,
    MemoryArea, MemoryCookieJar, StorageArea, StoreBackend, WebStorageBackend,
};
use crate::codec::Codec;
use crate::error::Result;
use crate::value::Value;

/// File name of the durable web-storage area inside a storage directory
pub const DURABLE_AREA_FILE: &str = "local_storage.json";

/// File name of the indexed database inside a storage directory
pub const INDEXED_DB_FILE: &str = "intercache.db.json";

/// Where the indexed backend keeps its object store
#[derive(Debug, Clone)]
pub enum IndexedLocation {
    File(PathBuf),
    Memory,
}

/// Storage handles every backend is constructed from
#[derive(Clone)]
pub struct StoreSettings {
    pub session: Arc<dyn StorageArea>,
    pub durable: Arc<dyn StorageArea>,
    pub cookies: Arc<dyn CookieJar>,
    pub indexed: IndexedLocation,
    pub codec: Codec,
}

impl StoreSettings {
    /// Everything in memory; nothing survives the process
    pub fn in_memory() -> Self {
        Self {
            session: Arc::new(MemoryArea::new()),
            durable: Arc::new(MemoryArea::new()),
            cookies: Arc::new(MemoryCookieJar::new()),
            indexed: IndexedLocation::Memory,
            codec: Codec::new(),
        }
    }

    /// Durable area and indexed database under `dir`, session data in memory
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            session: Arc::new(MemoryArea::new()),
            durable: Arc::new(FileArea::open(dir.join(DURABLE_AREA_FILE))?),
            cookies: Arc::new(MemoryCookieJar::new()),
            indexed: IndexedLocation::File(dir.join(INDEXED_DB_FILE)),
            codec: Codec::new(),
        })
    }

    pub fn with_cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookies = jar;
        self
    }

    pub fn with_session_area(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.session = area;
        self
    }

    pub fn with_durable_area(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.durable = area;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}

/// Delegates every storage call to the active backend
pub struct StoreFacade {
    settings: StoreSettings,
    active: RwLock<(BackendKind, Arc<dyn StoreBackend>)>,
    indexed: Mutex<Option<IndexedBackend>>,
}

impl StoreFacade {
    /// Facade starting on the web-storage backend
    pub fn new(settings: StoreSettings) -> Self {
        let store = Arc::new(WebStorageBackend::with_codec(
            settings.session.clone(),
            settings.durable.clone(),
            settings.codec.clone(),
        ));
        Self {
            settings,
            active: RwLock::new((BackendKind::Store, store)),
            indexed: Mutex::new(None),
        }
    }

    /// Construct a backend of the given kind
    pub fn get_store(&self, kind: BackendKind) -> Result<Arc<dyn StoreBackend>> {
        let settings = &self.settings;
        let store: Arc<dyn StoreBackend> = match kind {
            BackendKind::Store => Arc::new(WebStorageBackend::with_codec(
                settings.session.clone(),
                settings.durable.clone(),
                settings.codec.clone(),
            )),
            BackendKind::Cookie => Arc::new(CookieBackend::with_codec(
                settings.cookies.clone(),
                settings.codec.clone(),
            )),
            BackendKind::Indexed => Arc::new(self.indexed_backend()?),
        };
        Ok(store)
    }

    /// Construct a backend by name, unknown names select the web store
    pub fn get_store_named(&self, name: &str) -> Result<Arc<dyn StoreBackend>> {
        self.get_store(BackendKind::from_name(name))
    }

    fn indexed_backend(&self) -> Result<IndexedBackend> {
        let mut indexed = self.indexed.lock();
        if let Some(backend) = indexed.as_ref() {
            return Ok(backend.clone());
        }
        let backend = match &self.settings.indexed {
            IndexedLocation::File(path) => IndexedBackend::open_file(path)?,
            IndexedLocation::Memory => IndexedBackend::open_memory()?,
        };
        *indexed = Some(backend.clone());
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        self.active.read().0
    }

    /// Replace the active backend
    ///
    /// Operations already running against the previous backend finish there.
    pub fn set_kind(&self, kind: BackendKind) -> Result<()> {
        let store = self.get_store(kind)?;
        *self.active.write() = (kind, store);
        info!("Store backend switched to {}", kind);
        Ok(())
    }

    /// The backend currently receiving calls
    pub fn current(&self) -> Arc<dyn StoreBackend> {
        self.active.read().1.clone()
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.current().keys().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.current().clear().await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.current().has(key).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<i64>,
        attrs: Option<&CookieAttributes>,
    ) -> Result<bool> {
        self.current().set(key, value, ttl, attrs).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.current().get(key).await
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.current().get_string(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.current().remove(key).await
    }
}
