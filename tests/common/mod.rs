//! Behaviour every backend must share.
//!
//! Each integration test file builds a base [`StoreConfig`] for its backend
//! and runs these scenarios against it.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    dead_code
)]

use kvbridge::{Error, KeyValueStore, Payload, StoreConfig, open_store};

/// An expiry far in the future (2100-01-01).
pub const FAR_FUTURE: i64 = 4_102_444_800_000;

/// Opens a store on `base` scoped to `namespace`.
pub async fn open(base: &StoreConfig, namespace: &str) -> Box<dyn KeyValueStore> {
    open_store(base.clone().with_namespace(namespace))
        .await
        .expect("open store")
}

/// Builds a payload in the facade's `{"value", "expires"}` envelope.
pub fn envelope(value: &str, expires: Option<i64>) -> Payload {
    Payload::from(serde_json::json!({ "value": value, "expires": expires }))
}

/// Two namespaces over one backend never see each other's entries.
pub async fn namespace_isolation(base: &StoreConfig) {
    let a = open(base, "a").await;
    let b = open(base, "b").await;

    a.set("mykey", Payload::from("1")).await.unwrap();
    b.set("mykey", Payload::from("2")).await.unwrap();
    assert_eq!(a.get("mykey").await.unwrap().as_deref(), Some("1"));
    assert_eq!(b.get("mykey").await.unwrap().as_deref(), Some("2"));

    a.clear().await.unwrap();
    assert_eq!(a.get("mykey").await.unwrap(), None);
    assert_eq!(b.get("mykey").await.unwrap().as_deref(), Some("2"));
}

/// The caller-side `"<namespace>:"` prefix is optional.
pub async fn prefix_stripping(base: &StoreConfig) {
    let store = open(base, "users").await;
    store.set("users:42", Payload::from("ada")).await.unwrap();

    assert_eq!(store.get("42").await.unwrap().as_deref(), Some("ada"));
    assert_eq!(store.get("users:42").await.unwrap().as_deref(), Some("ada"));
    assert!(store.has("users:42").await.unwrap());
    assert!(store.delete("users:42").await.unwrap());
    assert!(!store.has("42").await.unwrap());
}

/// A second `set` replaces the value and recomputes the expiry.
pub async fn upsert_replaces_value(base: &StoreConfig) {
    let store = open(base, "upsert").await;
    store.set("k", envelope("v1", Some(1))).await.unwrap();
    store.set("k", envelope("v2", None)).await.unwrap();

    let raw = store.get("k").await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["value"], "v2");

    // The first expiry (1 ms after the epoch) no longer applies.
    store.clear_expired().await.unwrap();
    assert!(store.has("k").await.unwrap());
}

/// Batch reads stay aligned with the requested keys.
pub async fn get_many_alignment(base: &StoreConfig) {
    let store = open(base, "many").await;
    store
        .set_many(vec![
            ("k1".to_string(), Payload::from("v1")),
            ("k3".to_string(), Payload::from("v3")),
            ("k1".to_string(), Payload::from("v1-final")),
        ])
        .await
        .unwrap();

    let keys = vec!["k1".to_string(), "k2".to_string(), "many:k3".to_string()];
    assert_eq!(
        store.get_many(&keys).await.unwrap(),
        vec![Some("v1-final".to_string()), None, Some("v3".to_string())]
    );
    assert_eq!(
        store.has_many(&keys).await.unwrap(),
        vec![true, false, true]
    );
}

/// Empty batches short-circuit and misses report `false`.
pub async fn batch_boundaries(base: &StoreConfig) {
    let store = open(base, "bounds").await;
    assert!(store.get_many(&[]).await.unwrap().is_empty());
    assert!(store.has_many(&[]).await.unwrap().is_empty());
    assert!(!store.delete_many(&[]).await.unwrap());
    store.set_many(Vec::new()).await.unwrap();

    let missing = vec!["nope".to_string(), "nada".to_string()];
    assert!(!store.delete_many(&missing).await.unwrap());
    assert!(!store.delete("nope").await.unwrap());

    store.set("yes", Payload::from("1")).await.unwrap();
    let mixed = vec!["nope".to_string(), "yes".to_string()];
    assert!(store.delete_many(&mixed).await.unwrap());
}

/// Only past expiries are reaped, and a second sweep is a no-op.
pub async fn clear_expired_selectivity(base: &StoreConfig) {
    let store = open(base, "ttl").await;
    store.set("past", envelope("x", Some(1))).await.unwrap();
    store.set("future", envelope("y", Some(FAR_FUTURE))).await.unwrap();
    store.set("never", envelope("z", None)).await.unwrap();

    assert!(store.clear_expired().await.unwrap() >= 1);
    assert!(!store.has("past").await.unwrap());
    assert!(store.has("future").await.unwrap());
    assert!(store.has("never").await.unwrap());

    assert_eq!(store.clear_expired().await.unwrap(), 0);
}

/// Keyset iteration yields every key once, in order, across deletes.
pub async fn iterator_completeness(base: &StoreConfig) {
    let store = open_store(base.clone().with_namespace("iter").with_iteration_limit(2))
        .await
        .unwrap();
    for key in ["c", "a", "b"] {
        store.set(key, Payload::from(key)).await.unwrap();
    }

    let mut iter = store.iterator();
    let mut seen = Vec::new();
    while let Some((key, value)) = iter.next().await.unwrap() {
        if key == "iter:b" {
            // Behind the cursor: must not disturb the scan.
            assert!(store.delete("a").await.unwrap());
        }
        seen.push((key, value));
    }

    assert_eq!(
        seen,
        vec![
            ("iter:a".to_string(), "a".to_string()),
            ("iter:b".to_string(), "b".to_string()),
            ("iter:c".to_string(), "c".to_string()),
        ]
    );
}

/// Operations after `disconnect()` fail instead of hanging or returning
/// absent.
pub async fn disconnect_rejects(base: &StoreConfig) {
    let store = open(base, "bye").await;
    store.set("k", Payload::from("v")).await.unwrap();
    store.disconnect().await.unwrap();
    store.disconnect().await.unwrap();

    assert!(matches!(store.get("k").await, Err(Error::Disconnected)));
    assert!(matches!(
        store.set("k", Payload::from("v")).await,
        Err(Error::Disconnected)
    ));
    assert!(matches!(store.get_many(&[]).await, Err(Error::Disconnected)));
}

/// An entry refreshed while a sweep runs is never reaped.
pub async fn clear_expired_spares_refreshed(base: &StoreConfig) {
    let store = open(base, "refresh").await;
    let keys: Vec<String> = (0..20).map(|i| format!("k{i:02}")).collect();
    store
        .set_many(
            keys.iter()
                .map(|key| (key.clone(), envelope("stale", Some(1))))
                .collect(),
        )
        .await
        .unwrap();

    // Refreshed before the sweep starts.
    store
        .set(&keys[0], envelope("fresh", Some(FAR_FUTURE)))
        .await
        .unwrap();

    let refresh = async {
        for key in &keys[1..] {
            store
                .set(key, envelope("fresh", Some(FAR_FUTURE)))
                .await
                .unwrap();
        }
    };
    let (swept, ()) = tokio::join!(store.clear_expired(), refresh);
    swept.unwrap();

    for key in &keys {
        let raw = store
            .get(key)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{key} was reaped after its refresh"));
        assert!(raw.contains("fresh"), "{key} holds {raw}");
    }
    assert_eq!(store.clear_expired().await.unwrap(), 0);
}
