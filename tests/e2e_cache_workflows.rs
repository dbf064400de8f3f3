//! End-to-End Test Suite: memoized getters surviving restarts
//!
//! Each workflow builds a cache from a configuration file the way an
//! application would, uses it, shuts it down and starts a second cache over
//! the same storage directory.

use std::convert::Infallible;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use intercache::{
    BackendKind, CacheConfig, CacheLayer, CacheableOptions, KeySpec, Persistence, Value,
};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Write a YAML configuration pointing the cache at `storage`
fn write_config(dir: &Path, storage: &Path, persistence: &str) -> std::path::PathBuf {
    let path = dir.join("intercache.yaml");
    let content = format!(
        "persistence: {}\nkey_prefix: app_\npersist_ttl_secs: 3600\nstorage_dir: {}\n",
        persistence,
        serde_json::to_string(&storage.display().to_string()).unwrap()
    );
    fs::write(&path, content).expect("Failed to write config");
    path
}

/// Simulated remote lookup that counts how often it is reached
fn lookup(calls: Arc<AtomicUsize>) -> impl Fn(String) -> std::future::Ready<Result<Value, Infallible>> {
    move |name: String| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(Value::from(serde_json::json!({
            "name": name,
            "roles": ["reader"],
        }))))
    }
}

#[tokio::test]
async fn test_store_workflow_survives_restart() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let storage = temp_dir.path().join("storage");
    let config_path = write_config(temp_dir.path(), &storage, "store");
    let calls = Arc::new(AtomicUsize::new(0));

    // First run: cold cache, every distinct user reaches the getter once
    {
        let config = CacheConfig::load(&config_path).expect("Failed to load config");
        let cache = CacheLayer::new(config).expect("Failed to build cache");
        cache.rehydrated().await;

        let users = cache.cacheable(
            lookup(calls.clone()),
            KeySpec::derive(|name: &String| format!("user-{}", name)),
            CacheableOptions::default(),
        );
        for name in ["ada", "grace", "ada"] {
            users.call(name.to_string()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.facade().kind(), BackendKind::Store);
        cache.flush().await;
    }

    // Second run: everything comes back from disk
    let config = CacheConfig::load(&config_path).expect("Failed to load config");
    let cache = CacheLayer::new(config).expect("Failed to build cache");
    cache.rehydrated().await;

    let users = cache.cacheable(
        lookup(calls.clone()),
        KeySpec::derive(|name: &String| format!("user-{}", name)),
        CacheableOptions::default(),
    );
    let ada = users.call("ada".to_string()).await.unwrap();
    assert_eq!(
        ada,
        Value::from(serde_json::json!({"name": "ada", "roles": ["reader"]}))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().hit_rate(), 100.0);
    assert_eq!(cache.get_all().len(), 2);
    assert!(cache.get_all().keys().all(|k| k.starts_with("app_")));
}

#[tokio::test]
async fn test_indexed_workflow_survives_restart() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let storage = temp_dir.path().join("storage");
    let config_path = write_config(temp_dir.path(), &storage, "indexed");

    {
        let cache = CacheLayer::new(CacheConfig::load(&config_path).unwrap()).unwrap();
        cache.put("launched", Value::date_millis(1_600_000_000_000).unwrap());
        cache.put("ratio", Value::nan());
        cache.flush().await;
        cache.rehydrated().await;
    }

    let cache = CacheLayer::new(CacheConfig::load(&config_path).unwrap()).unwrap();
    cache.rehydrated().await;
    assert_eq!(cache.persistence(), Persistence::Indexed);
    assert_eq!(
        cache.get("launched"),
        Some(Value::date_millis(1_600_000_000_000).unwrap())
    );
    assert_eq!(cache.get("ratio"), Some(Value::nan()));
    assert_eq!(cache.stats().rehydrated, 2);
}

#[tokio::test]
async fn test_disabled_persistence_keeps_disk_untouched() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let storage = temp_dir.path().join("storage");
    let config_path = write_config(temp_dir.path(), &storage, "false");

    {
        let cache = CacheLayer::new(CacheConfig::load(&config_path).unwrap()).unwrap();
        cache.put("volatile", "gone after restart");
        cache.flush().await;
        cache.rehydrated().await;
    }

    let cache = CacheLayer::new(CacheConfig::load(&config_path).unwrap()).unwrap();
    cache.rehydrated().await;
    assert!(!cache.has("volatile"));
    assert_eq!(cache.stats().persisted_writes, 0);
}
