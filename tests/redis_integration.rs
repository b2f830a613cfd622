//! Redis collection integration tests.
//!
//! These tests require a running Redis server. Set the environment variable
//! `KVBRIDGE_TEST_REDIS_URL` to enable these tests:
//!
//! ```bash
//! export KVBRIDGE_TEST_REDIS_URL="redis://localhost:6379"
//! cargo test --features redis --test redis_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
#![cfg(feature = "redis")]

mod common;

use kvbridge::StoreConfig;
use std::env;
use uuid::Uuid;

/// Environment variable for Redis test connection URL.
const REDIS_URL_ENV: &str = "KVBRIDGE_TEST_REDIS_URL";

/// Returns the Redis connection URL if available, or None to skip tests.
fn get_redis_url() -> Option<String> {
    env::var(REDIS_URL_ENV).ok()
}

/// Macro to skip tests when Redis is not available.
macro_rules! require_redis {
    () => {
        match get_redis_url() {
            Some(url) => url,
            None => {
                eprintln!(
                    "Skipping test: {} not set. Set this environment variable to run Redis tests.",
                    REDIS_URL_ENV
                );
                return;
            }
        }
    };
}

/// A fresh collection on its own connection.
///
/// Redis pools carry no driver options, so distinct pool sizes keep each
/// test's connection (and its `disconnect`) separate.
fn base(url: &str, slot: usize) -> StoreConfig {
    let pool = kvbridge::PoolOptions {
        max_size: Some(slot),
        ..kvbridge::PoolOptions::default()
    };
    StoreConfig::new(url)
        .with_table(format!("test_kv_{}", Uuid::new_v4().simple()))
        .with_pool(pool)
}

#[tokio::test]
async fn test_namespace_isolation() {
    let url = require_redis!();
    common::namespace_isolation(&base(&url, 1)).await;
}

#[tokio::test]
async fn test_prefix_stripping() {
    let url = require_redis!();
    common::prefix_stripping(&base(&url, 2)).await;
}

#[tokio::test]
async fn test_upsert_replaces_value() {
    let url = require_redis!();
    common::upsert_replaces_value(&base(&url, 3)).await;
}

#[tokio::test]
async fn test_get_many_alignment() {
    let url = require_redis!();
    common::get_many_alignment(&base(&url, 4)).await;
}

#[tokio::test]
async fn test_batch_boundaries() {
    let url = require_redis!();
    common::batch_boundaries(&base(&url, 5)).await;
}

#[tokio::test]
async fn test_clear_expired_selectivity() {
    let url = require_redis!();
    common::clear_expired_selectivity(&base(&url, 6)).await;
}

#[tokio::test]
async fn test_clear_expired_spares_refreshed() {
    let url = require_redis!();
    common::clear_expired_spares_refreshed(&base(&url, 10)).await;
}

#[tokio::test]
async fn test_iterator_completeness() {
    let url = require_redis!();
    common::iterator_completeness(&base(&url, 7)).await;
}

#[tokio::test]
async fn test_disconnect_rejects() {
    let url = require_redis!();
    common::disconnect_rejects(&base(&url, 8)).await;
}

#[tokio::test]
async fn test_clear_unused_for_is_bucket_only() {
    use kvbridge::storage::DocumentStore;
    use std::time::Duration;

    let url = require_redis!();
    let store = DocumentStore::open(base(&url, 9)).await.unwrap();
    assert!(matches!(
        store.clear_unused_for(Duration::from_secs(1)).await,
        Err(kvbridge::Error::InvalidInput(_))
    ));
}
