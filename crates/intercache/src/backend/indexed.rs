//! Indexed database backend
//!
//! Records are kept in an [`ObjectStore`] as native [`Value`]s, without the
//! string codec. Opening the store happens once in the background; anything
//! issued before it is ready waits in a queue that is replayed in order.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info};

use super::{
    durable_expiry, is_expired, logical, namespaced, BackendKind, CookieAttributes, StoreBackend,
};
use crate::error::{CacheError, Result};
use crate::value::Value;

/// One row of the object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedRecord {
    /// Namespaced key
    pub key: String,
    pub value: Value,
    /// Millisecond expiry, negative for never, `None` for session writes
    pub expires: Option<i64>,
}

/// Async key-value object store keyed by namespaced key
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_all_keys(&self) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Option<IndexedRecord>>;

    async fn put(&self, record: IndexedRecord) -> Result<()>;

    /// Delete a row, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryObjectStore {
    rows: RwLock<BTreeMap<String, IndexedRecord>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.rows.read().await.keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<IndexedRecord>> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn put(&self, record: IndexedRecord) -> Result<()> {
        self.rows.write().await.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.rows.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.write().await.clear();
        Ok(())
    }
}

/// Object store persisted as one JSON document
pub struct FileObjectStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileObjectStore {
    /// Open the database file, creating an empty store on first use
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if !path.exists() {
            tokio::fs::write(&path, "{}").await?;
            info!("Created object store at {}", path.display());
        }
        Ok(Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<BTreeMap<String, IndexedRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&content).map_err(|e| CacheError::Storage {
            message: format!("corrupt object store {}: {}", self.path.display(), e),
        })
    }

    async fn save(&self, rows: &BTreeMap<String, IndexedRecord>) -> Result<()> {
        let json = serde_json::to_string(rows)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<IndexedRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn put(&self, record: IndexedRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        rows.insert(record.key.clone(), record);
        self.save(&rows).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        let existed = rows.remove(key).is_some();
        if existed {
            self.save(&rows).await?;
        }
        Ok(existed)
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save(&BTreeMap::new()).await
    }
}

#[derive(Debug)]
enum Command {
    Keys,
    Clear,
    Has(String),
    Set {
        key: String,
        value: Value,
        expires: Option<i64>,
    },
    Get(String),
    Remove(String),
}

#[derive(Debug)]
enum Reply {
    Keys(Vec<String>),
    Done,
    Flag(bool),
    Value(Option<Value>),
}

struct Pending {
    command: Command,
    resolver: oneshot::Sender<Result<Reply>>,
}

enum Connection {
    Opening(Vec<Pending>),
    Ready(Arc<dyn ObjectStore>),
    Failed(String),
}

/// Backend over an asynchronously opened object store
///
/// Clones share one connection and one pending queue.
#[derive(Clone)]
pub struct IndexedBackend {
    connection: Arc<Mutex<Connection>>,
}

impl IndexedBackend {
    /// Start opening the store in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<F>(opener: F) -> Result<Self>
    where
        F: Future<Output = Result<Arc<dyn ObjectStore>>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        let connection = Arc::new(Mutex::new(Connection::Opening(Vec::new())));

        let shared = connection.clone();
        runtime.spawn(async move {
            match opener.await {
                Ok(store) => {
                    let previous =
                        std::mem::replace(&mut *shared.lock(), Connection::Ready(store.clone()));
                    let queued = match previous {
                        Connection::Opening(queued) => queued,
                        _ => Vec::new(),
                    };
                    debug!("Object store ready, replaying {} queued operations", queued.len());
                    for pending in queued {
                        let reply = execute(store.as_ref(), pending.command).await;
                        let _ = pending.resolver.send(reply);
                    }
                }
                Err(e) => {
                    error!("Failed to open object store: {}", e);
                    let message = e.to_string();
                    let previous =
                        std::mem::replace(&mut *shared.lock(), Connection::Failed(message.clone()));
                    let queued = match previous {
                        Connection::Opening(queued) => queued,
                        _ => Vec::new(),
                    };
                    for pending in queued {
                        let _ = pending
                            .resolver
                            .send(Err(CacheError::connection(message.clone())));
                    }
                }
            }
        });

        Ok(Self { connection })
    }

    /// Open a [`FileObjectStore`] at `path`
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::open(async move {
            let store: Arc<dyn ObjectStore> = Arc::new(FileObjectStore::open(path).await?);
            Ok(store)
        })
    }

    /// Open an in-memory store
    pub fn open_memory() -> Result<Self> {
        Self::open(async {
            let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
            Ok(store)
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.connection.lock(), Connection::Ready(_))
    }

    async fn dispatch(&self, command: Command) -> Result<Reply> {
        let route = {
            let mut state = self.connection.lock();
            let route = match &mut *state {
                Connection::Ready(store) => Route::Direct(store.clone(), command),
                Connection::Failed(message) => return Err(CacheError::connection(message.clone())),
                Connection::Opening(queue) => {
                    let (resolver, receiver) = oneshot::channel();
                    queue.push(Pending { command, resolver });
                    Route::Queued(receiver)
                }
            };
            route
        };
        match route {
            Route::Direct(store, command) => execute(store.as_ref(), command).await,
            Route::Queued(receiver) => receiver
                .await
                .map_err(|_| CacheError::connection("object store dropped before it was ready"))?,
        }
    }
}

enum Route {
    Direct(Arc<dyn ObjectStore>, Command),
    Queued(oneshot::Receiver<Result<Reply>>),
}

async fn execute(store: &dyn ObjectStore, command: Command) -> Result<Reply> {
    match command {
        Command::Keys => Ok(Reply::Keys(
            store
                .get_all_keys()
                .await?
                .iter()
                .filter_map(|k| logical(k))
                .collect(),
        )),
        Command::Clear => store.clear().await.map(|_| Reply::Done),
        Command::Has(key) => Ok(Reply::Flag(store.get(&key).await?.is_some())),
        Command::Set {
            key,
            value,
            expires,
        } => {
            store
                .put(IndexedRecord {
                    key,
                    value,
                    expires,
                })
                .await?;
            Ok(Reply::Done)
        }
        Command::Get(key) => match store.get(&key).await? {
            Some(record) if record.expires.is_some_and(is_expired) => {
                debug!("Indexed record expired: {}", key);
                store.delete(&key).await?;
                Ok(Reply::Value(None))
            }
            Some(record) => Ok(Reply::Value(Some(record.value))),
            None => Ok(Reply::Value(None)),
        },
        Command::Remove(key) => Ok(Reply::Flag(store.delete(&key).await?)),
    }
}

fn unexpected(reply: Reply) -> CacheError {
    CacheError::storage(format!("unexpected object store reply: {reply:?}"))
}

#[async_trait]
impl StoreBackend for IndexedBackend {
    async fn keys(&self) -> Result<Vec<String>> {
        match self.dispatch(Command::Keys).await? {
            Reply::Keys(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.dispatch(Command::Clear).await.map(|_| ())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match self.dispatch(Command::Has(namespaced(key))).await? {
            Reply::Flag(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<i64>,
        _attrs: Option<&CookieAttributes>,
    ) -> Result<bool> {
        let expires = match ttl {
            None => None,
            Some(ttl) => match durable_expiry(ttl) {
                Some(expires) => Some(expires),
                None => return Ok(false),
            },
        };
        self.dispatch(Command::Set {
            key: namespaced(key),
            value: value.clone(),
            expires,
        })
        .await?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.dispatch(Command::Get(namespaced(key))).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Always `None`: values are stored natively, not as encoded strings
    async fn get_string(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        match self.dispatch(Command::Remove(namespaced(key))).await? {
            Reply::Flag(removed) => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Indexed
    }
}
