//! # intercache
//!
//! Memoization for asynchronous data getters, with optional persistence of
//! cached results so they survive process restarts.
//!
//! ## Features
//!
//! - **Memoization**: wrap a getter once, call it many times; only misses reach it
//! - **Validation**: results are cached only when a pluggable validator accepts them
//! - **Lossless storage**: strings, numbers (including NaN and `-0`), dates,
//!   regular expressions, function source, JSON data and `null`/`undefined`
//! - **Pluggable backends**: web-storage style session and durable tiers,
//!   cookies, and an asynchronously opened indexed object store
//! - **Rehydration**: persisted entries are reloaded in the background at startup
//!
//! ## Example
//!
//! ```no_run
//! use std::convert::Infallible;
//! use intercache::{CacheConfig, CacheLayer, CacheableOptions, KeySpec, Persistence};
//!
//! # async fn demo() -> intercache::Result<()> {
//! let cache = CacheLayer::new(CacheConfig {
//!     persistence: Persistence::Store,
//!     ..CacheConfig::default()
//! })?;
//!
//! let user = cache.cacheable(
//!     |id: u32| async move { Ok::<_, Infallible>(format!("user {}", id)) },
//!     KeySpec::derive(|id: &u32| format!("user-{}", id)),
//!     CacheableOptions::default(),
//! );
//!
//! cache.rehydrated().await;
//! let _ = user.call(7).await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod value;

pub use backend::{
    BackendKind, CookieAttributes, CookieBackend, CookieJar, FileArea, FileObjectStore,
    IndexedBackend, IndexedRecord, MemoryArea, MemoryCookieJar, MemoryObjectStore, ObjectStore,
    StorageArea, StoreBackend, WebStorageBackend, NAMESPACE,
};
pub use cache::{
    default_validator, CacheLayer, Cacheable, CacheableOptions, KeyPattern, KeySpec, Validator,
    PERSISTENCE_MARKER,
};
pub use codec::{Codec, EncodedEntry, JsonSerializer, OPAQUE_PLACEHOLDER};
pub use config::{CacheConfig, ConfigFormat, EnvOverrides, Persistence, DEFAULT_KEY_PREFIX};
pub use error::CacheError;
pub use facade::{IndexedLocation, StoreFacade, StoreSettings};
pub use metrics::{CacheMetrics, CacheStats};
pub use value::{TypeTag, Value};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, CacheError>;
