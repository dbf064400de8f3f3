//! Memoization layer
//!
//! [`CacheLayer`] keeps an in-memory mapping from namespaced keys to values
//! and, while persistence is enabled, mirrors every cached value to the
//! active [`StoreFacade`] backend. Mirrored writes run on a single background
//! writer so they reach the backend in the order they were issued.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use regex::Regex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backend::{CookieAttributes, StoreBackend};
use crate::config::{CacheConfig, Persistence, DEFAULT_KEY_PREFIX};
use crate::error::{CacheError, Result};
use crate::facade::{StoreFacade, StoreSettings};
use crate::metrics::{CacheMetrics, CacheStats, OperationTimer};
use crate::value::Value;

/// Reserved key whose value `"1"` marks a backend as holding cache data
pub const PERSISTENCE_MARKER: &str = "intercache::persistence";

const MARKER_VALUE: &str = "1";

/// Decides whether a getter result is worth caching
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Accepts everything except `Null` and `Undefined`
pub fn default_validator() -> Validator {
    Arc::new(|value: &Value| !value.is_nil())
}

type KeyDeriver<A> = Arc<dyn Fn(&A) -> BoxFuture<'static, String> + Send + Sync>;

/// How a wrapped getter turns its arguments into a cache key
pub enum KeySpec<A> {
    /// The same key for every call
    Literal(String),
    /// A key computed from the call arguments
    Derive(KeyDeriver<A>),
}

impl<A> KeySpec<A> {
    pub fn literal(key: impl Into<String>) -> Self {
        KeySpec::Literal(key.into())
    }

    pub fn derive<F>(deriver: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        KeySpec::Derive(Arc::new(move |args: &A| {
            futures::future::ready(deriver(args)).boxed()
        }))
    }

    pub fn derive_async<F, Fut>(deriver: F) -> Self
    where
        F: Fn(&A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        KeySpec::Derive(Arc::new(move |args: &A| deriver(args).boxed()))
    }

    async fn resolve(&self, args: &A) -> String {
        match self {
            KeySpec::Literal(key) => key.clone(),
            KeySpec::Derive(deriver) => deriver(args).await,
        }
    }
}

impl<A> Clone for KeySpec<A> {
    fn clone(&self) -> Self {
        match self {
            KeySpec::Literal(key) => KeySpec::Literal(key.clone()),
            KeySpec::Derive(deriver) => KeySpec::Derive(deriver.clone()),
        }
    }
}

impl<A> From<&str> for KeySpec<A> {
    fn from(key: &str) -> Self {
        KeySpec::Literal(key.to_string())
    }
}

impl<A> From<String> for KeySpec<A> {
    fn from(key: String) -> Self {
        KeySpec::Literal(key)
    }
}

/// Per-getter options
#[derive(Clone, Default)]
pub struct CacheableOptions {
    /// Overrides the layer's default validator for this getter
    pub validator: Option<Validator>,
}

impl CacheableOptions {
    pub fn with_validator<F>(validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            validator: Some(Arc::new(validator)),
        }
    }
}

/// Selects keys for [`CacheLayer::del`]
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// One logical key, prefixed before lookup
    Exact(String),
    /// Every namespaced key the expression matches
    Regex(Regex),
}

impl KeyPattern {
    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(KeyPattern::Regex(Regex::new(pattern)?))
    }
}

impl From<&str> for KeyPattern {
    fn from(key: &str) -> Self {
        KeyPattern::Exact(key.to_string())
    }
}

impl From<String> for KeyPattern {
    fn from(key: String) -> Self {
        KeyPattern::Exact(key)
    }
}

impl From<Regex> for KeyPattern {
    fn from(pattern: Regex) -> Self {
        KeyPattern::Regex(pattern)
    }
}

enum WriteCommand {
    Set {
        backend: Arc<dyn StoreBackend>,
        key: String,
        value: Value,
    },
    Remove {
        backend: Arc<dyn StoreBackend>,
        key: String,
    },
    Flush(oneshot::Sender<()>),
}

struct Options {
    persistence: Persistence,
    key_prefix: String,
    validator: Validator,
}

struct Inner {
    entries: RwLock<HashMap<String, Value>>,
    options: RwLock<Options>,
    facade: Arc<StoreFacade>,
    metrics: CacheMetrics,
    runtime: Handle,
    persist_ttl: Option<i64>,
    writer: mpsc::UnboundedSender<WriteCommand>,
    pending_rehydrations: Arc<watch::Sender<usize>>,
}

/// Counts one outstanding rehydration until dropped
struct RehydrationGuard(Arc<watch::Sender<usize>>);

impl RehydrationGuard {
    fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|pending| *pending += 1);
        Self(counter.clone())
    }
}

impl Drop for RehydrationGuard {
    fn drop(&mut self) {
        self.0.send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

/// Memoizing cache with optional persistence
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<Inner>,
}

impl CacheLayer {
    /// Cache whose durable data lives under `config.storage_dir`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let settings = StoreSettings::in_dir(&config.storage_dir)?;
        Self::with_settings(config, settings)
    }

    /// Cache whose backends never touch the disk
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::with_settings(config, StoreSettings::in_memory())
    }

    pub fn with_settings(config: CacheConfig, settings: StoreSettings) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        config.validate()?;

        let metrics = CacheMetrics::new();
        let (writer, commands) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(
            commands,
            metrics.clone(),
            config.persist_ttl_secs,
            config.cookie_attributes(),
        ));

        let key_prefix = if config.key_prefix.trim().is_empty() {
            DEFAULT_KEY_PREFIX.to_string()
        } else {
            config.key_prefix.clone()
        };

        let layer = Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                options: RwLock::new(Options {
                    persistence: Persistence::Disabled,
                    key_prefix,
                    validator: default_validator(),
                }),
                facade: Arc::new(StoreFacade::new(settings)),
                metrics,
                runtime,
                persist_ttl: config.persist_ttl_secs,
                writer,
                pending_rehydrations: Arc::new(watch::channel(0).0),
            }),
        };

        if config.persistence.is_enabled() {
            layer.set_persistence(config.persistence)?;
        } else {
            layer.spawn_rehydration(layer.inner.facade.current(), false);
        }

        Ok(layer)
    }

    /// Wrap `getter` so its results are memoized under `key`
    ///
    /// The current key prefix and, unless `options` names one, the current
    /// default validator are fixed for the wrapped getter's lifetime.
    pub fn cacheable<A, F, Fut>(
        &self,
        getter: F,
        key: impl Into<KeySpec<A>>,
        options: CacheableOptions,
    ) -> Cacheable<A, F>
    where
        F: Fn(A) -> Fut,
    {
        let (key_prefix, validator) = {
            let current = self.inner.options.read();
            let validator = options
                .validator
                .unwrap_or_else(|| current.validator.clone());
            (current.key_prefix.clone(), validator)
        };
        Cacheable {
            layer: self.clone(),
            getter,
            key: key.into(),
            key_prefix,
            validator,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.inner.options.read().key_prefix, key)
    }

    /// Delete matching entries from memory and from the store
    ///
    /// Returns the number of in-memory entries removed.
    pub fn del(&self, pattern: impl Into<KeyPattern>) -> usize {
        let backend = self.inner.facade.current();
        let removed: Vec<String> = match pattern.into() {
            KeyPattern::Exact(key) => {
                let namespaced = self.namespaced(&key);
                let existed = self.inner.entries.write().remove(&namespaced).is_some();
                self.enqueue(WriteCommand::Remove {
                    backend,
                    key: namespaced,
                });
                return usize::from(existed);
            }
            KeyPattern::Regex(pattern) => {
                let mut entries = self.inner.entries.write();
                let matching: Vec<String> = entries
                    .keys()
                    .filter(|key| pattern.is_match(key))
                    .cloned()
                    .collect();
                for key in &matching {
                    entries.remove(key);
                }
                matching
            }
        };

        let count = removed.len();
        for key in removed {
            self.enqueue(WriteCommand::Remove {
                backend: backend.clone(),
                key,
            });
        }
        debug!("Deleted {} cache entries by pattern", count);
        count
    }

    /// Remove every prefixed key from the store and empty the in-memory cache
    ///
    /// Entries stored under other prefixes are dropped from memory too.
    pub fn del_all(&self) {
        let prefix = self.key_prefix();
        let backend = self.inner.facade.current();
        let drained = std::mem::take(&mut *self.inner.entries.write());

        for key in drained.into_keys().filter(|key| key.starts_with(&prefix)) {
            self.enqueue(WriteCommand::Remove {
                backend: backend.clone(),
                key,
            });
        }
    }

    /// Store `value` under `key`, bypassing the validator
    pub fn put(&self, key: &str, value: impl Into<Value>) {
        let namespaced = self.namespaced(key);
        self.store(namespaced, value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        let namespaced = self.namespaced(key);
        self.inner.entries.read().contains_key(&namespaced)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let namespaced = self.namespaced(key);
        self.inner.entries.read().get(&namespaced).cloned()
    }

    /// Every in-memory entry under its namespaced key
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(key, _)| key.as_str() != PERSISTENCE_MARKER)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn persistence(&self) -> Persistence {
        self.inner.options.read().persistence
    }

    /// Enable or disable mirroring
    ///
    /// Enabling switches the store to the matching backend, writes the
    /// persistence marker and starts a rehydration from that backend.
    /// Disabling leaves the active backend and its marker in place.
    pub fn set_persistence(&self, persistence: impl Into<Persistence>) -> Result<()> {
        let persistence = persistence.into();
        if let Some(kind) = persistence.backend_kind() {
            self.inner.facade.set_kind(kind)?;
            self.inner.options.write().persistence = persistence;
            self.spawn_rehydration(self.inner.facade.current(), true);
        } else {
            self.inner.options.write().persistence = persistence;
        }
        info!("Cache persistence set to {}", persistence);
        Ok(())
    }

    pub fn key_prefix(&self) -> String {
        self.inner.options.read().key_prefix.clone()
    }

    /// Change the key prefix; blank input restores the default
    pub fn set_key_prefix(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        self.inner.options.write().key_prefix = if prefix.trim().is_empty() {
            DEFAULT_KEY_PREFIX.to_string()
        } else {
            prefix
        };
    }

    pub fn validator(&self) -> Validator {
        self.inner.options.read().validator.clone()
    }

    /// Replace the default validator used by getters without their own
    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.inner.options.write().validator = Arc::new(validator);
    }

    /// Wait until every rehydration started so far has finished
    pub async fn rehydrated(&self) {
        let mut pending = self.inner.pending_rehydrations.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    /// Wait until every mirrored write issued so far has reached its backend
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.writer.send(WriteCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entry_count = self.inner.entries.read().len();
        self.inner.metrics.snapshot(entry_count)
    }

    pub fn facade(&self) -> Arc<StoreFacade> {
        self.inner.facade.clone()
    }

    fn store(&self, namespaced: String, value: Value) {
        let mirror = self.persistence().is_enabled().then(|| value.clone());
        self.inner.entries.write().insert(namespaced.clone(), value);

        if let Some(value) = mirror {
            self.enqueue(WriteCommand::Set {
                backend: self.inner.facade.current(),
                key: namespaced,
                value,
            });
        }
    }

    fn enqueue(&self, command: WriteCommand) {
        if self.inner.writer.send(command).is_err() {
            warn!("Cache writer has stopped, dropping store operation");
            self.inner.metrics.record_persistence_failure();
        }
    }

    fn spawn_rehydration(&self, backend: Arc<dyn StoreBackend>, write_marker: bool) {
        let guard = RehydrationGuard::new(&self.inner.pending_rehydrations);
        let layer = self.clone();
        self.inner.runtime.spawn(async move {
            let _guard = guard;
            if write_marker {
                layer.write_marker(backend.as_ref()).await;
            }
            layer.rehydrate(backend.as_ref()).await;
        });
    }

    async fn write_marker(&self, backend: &dyn StoreBackend) {
        match backend
            .set(
                PERSISTENCE_MARKER,
                &Value::from(MARKER_VALUE),
                self.inner.persist_ttl,
                None,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("{} backend rejected the persistence marker", backend.kind()),
            Err(e) => {
                warn!("Failed to write persistence marker: {}", e);
                self.inner.metrics.record_persistence_failure();
            }
        }
    }

    async fn rehydrate(&self, backend: &dyn StoreBackend) {
        let marker = match backend.get(PERSISTENCE_MARKER).await {
            Ok(marker) => marker,
            Err(e) => {
                warn!("Failed to read persistence marker: {}", e);
                self.inner.metrics.record_persistence_failure();
                return;
            }
        };
        if marker.as_ref().and_then(Value::as_str) != Some(MARKER_VALUE) {
            debug!("No persisted cache found in {} backend", backend.kind());
            return;
        }

        let keys = match backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list persisted keys: {}", e);
                self.inner.metrics.record_persistence_failure();
                return;
            }
        };

        let mut restored = 0u64;
        for key in keys {
            match backend.get(&key).await {
                Ok(Some(value)) => {
                    if key != PERSISTENCE_MARKER {
                        restored += 1;
                    }
                    self.inner.entries.write().entry(key).or_insert(value);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping persisted key {}: {}", key, e),
            }
        }

        self.inner.metrics.record_rehydrated(restored);
        info!(
            "Rehydrated {} entries from {} backend",
            restored,
            backend.kind()
        );
    }
}

async fn run_writer(
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    metrics: CacheMetrics,
    ttl: Option<i64>,
    attrs: Option<CookieAttributes>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Set {
                backend,
                key,
                value,
            } => match backend.set(&key, &value, ttl, attrs.as_ref()).await {
                Ok(true) => {
                    debug!("Persisted {} to {} backend", key, backend.kind());
                    metrics.record_persisted_write();
                }
                Ok(false) => {
                    warn!("{} backend rejected write of {}", backend.kind(), key);
                    metrics.record_persistence_failure();
                }
                Err(e) => {
                    warn!("Failed to persist {}: {}", key, e);
                    metrics.record_persistence_failure();
                }
            },
            WriteCommand::Remove { backend, key } => {
                if let Err(e) = backend.remove(&key).await {
                    warn!("Failed to remove persisted {}: {}", key, e);
                    metrics.record_persistence_failure();
                }
            }
            WriteCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// A getter wrapped by [`CacheLayer::cacheable`]
pub struct Cacheable<A, F> {
    layer: CacheLayer,
    getter: F,
    key: KeySpec<A>,
    key_prefix: String,
    validator: Validator,
}

impl<A, F> Cacheable<A, F> {
    /// Answer from memory, or invoke the getter and cache a valid result
    ///
    /// Getter errors are returned unchanged and nothing is cached.
    pub async fn call<Fut, T, E>(&self, args: A) -> std::result::Result<Value, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Into<Value>,
    {
        let key = self.key.resolve(&args).await;
        let namespaced = format!("{}{}", self.key_prefix, key);

        let cached = self.layer.inner.entries.read().get(&namespaced).cloned();
        if let Some(value) = cached {
            debug!("Cache hit for {}", namespaced);
            self.layer.inner.metrics.record_hit();
            return Ok(value);
        }

        debug!("Cache miss for {}", namespaced);
        let timer = OperationTimer::start();
        let result = (self.getter)(args).await;
        self.layer.inner.metrics.record_miss(timer.elapsed_ms());
        let value: Value = result?.into();

        if (self.validator)(&value) {
            self.layer.store(namespaced, value.clone());
        } else {
            debug!("Validator rejected result for {}", namespaced);
            self.layer.inner.metrics.record_rejection();
        }

        Ok(value)
    }
}
