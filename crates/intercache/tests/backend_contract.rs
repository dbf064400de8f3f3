//! Behaviour every persistence backend shares, run against all three

use std::sync::Arc;
use std::time::Duration;

use intercache::{
    BackendKind, CookieAttributes, MemoryCookieJar, StoreBackend, StoreFacade, StoreSettings,
    Value,
};
use tempfile::TempDir;

fn backends(dir: &TempDir) -> Vec<Arc<dyn StoreBackend>> {
    let facade = StoreFacade::new(StoreSettings::in_dir(dir.path()).unwrap());
    [BackendKind::Store, BackendKind::Cookie, BackendKind::Indexed]
        .into_iter()
        .map(|kind| facade.get_store(kind).unwrap())
        .collect()
}

fn samples() -> Vec<(&'static str, Value)> {
    vec![
        ("string", Value::from("hello; world=1")),
        ("integer", Value::from(42)),
        ("negative-zero", Value::Number(-0.0)),
        ("nan", Value::nan()),
        ("date", Value::date_millis(1_700_000_000_123).unwrap()),
        ("boolean", Value::from(false)),
        ("null", Value::Null),
        ("undefined", Value::Undefined),
        ("regexp", Value::RegExp("^user-\\d+$".to_string())),
        ("function", Value::Function("function add(a, b) { return a + b; }".to_string())),
        ("json", Value::from(serde_json::json!({"id": 1, "tags": ["a", "b"]}))),
    ]
}

#[tokio::test]
async fn test_values_round_trip_on_every_backend() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir) {
        for (key, value) in samples() {
            assert!(backend.set(key, &value, Some(60), None).await.unwrap());
            let restored = backend.get(key).await.unwrap();
            assert_eq!(
                restored.as_ref(),
                Some(&value),
                "{} backend lost {}",
                backend.kind(),
                key
            );
        }
    }
}

#[tokio::test]
async fn test_zero_ttl_is_rejected_everywhere() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir) {
        assert!(!backend.set("zero", &Value::from(1), Some(0), None).await.unwrap());
        assert!(!backend.has("zero").await.unwrap());
    }
}

#[tokio::test]
async fn test_keys_remove_and_clear() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir) {
        backend.set("a", &Value::from(1), Some(60), None).await.unwrap();
        backend.set("b c", &Value::from(2), Some(60), None).await.unwrap();

        let mut keys = backend.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b c".to_string()], "{}", backend.kind());

        assert!(backend.remove("a").await.unwrap());
        assert!(!backend.remove("a").await.unwrap());
        assert_eq!(backend.get("a").await.unwrap(), None);

        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_string_backends_expose_payloads() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir) {
        backend.set("text", &Value::from(7), Some(60), None).await.unwrap();
        let raw = backend.get_string("text").await.unwrap();
        match backend.kind() {
            BackendKind::Indexed => assert_eq!(raw, None),
            _ => assert_eq!(raw.as_deref(), Some("7")),
        }
    }
}

#[tokio::test]
async fn test_durable_entries_expire() {
    let dir = TempDir::new().unwrap();
    for backend in backends(&dir) {
        backend.set("short", &Value::from("soon gone"), Some(2), None).await.unwrap();
        assert_eq!(
            backend.get("short").await.unwrap(),
            Some(Value::from("soon gone"))
        );
    }

    tokio::time::sleep(Duration::from_millis(3100)).await;

    for backend in backends(&dir) {
        assert_eq!(
            backend.get("short").await.unwrap(),
            None,
            "{} backend kept an expired entry",
            backend.kind()
        );
    }
}

#[tokio::test]
async fn test_cookie_scope_round_trip() {
    let jar = Arc::new(MemoryCookieJar::new());
    let facade = StoreFacade::new(StoreSettings::in_memory().with_cookie_jar(jar.clone()));
    let cookies = facade.get_store(BackendKind::Cookie).unwrap();
    let attrs = CookieAttributes {
        path: Some("/app".to_string()),
        domain: Some("example.com".to_string()),
        secure: true,
    };

    cookies.set("scoped", &Value::from(1), Some(60), Some(&attrs)).await.unwrap();
    assert_eq!(jar.len(), 1);
    assert!(cookies.remove("scoped").await.unwrap());
    assert!(jar.is_empty());
}
