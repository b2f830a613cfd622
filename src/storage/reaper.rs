//! Background expiry reaper.

use super::store::{Store, StoreInner};
use super::traits::{KeyValueStore, StorageBackend};
use crate::Error;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Calls `clear_expired` every `interval` until the store is gone or closed.
///
/// The first sweep happens one full interval after scheduling.
pub(super) async fn run<B: StorageBackend>(store: Weak<StoreInner<B>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = store.upgrade() else {
            break;
        };
        let store = Store::from_inner(inner);
        if store.is_closed() {
            break;
        }

        match store.clear_expired().await {
            Ok(removed) => {
                tracing::trace!(backend = store.backend_name(), removed, "Expiry sweep done");
            },
            Err(Error::Disconnected) => break,
            Err(e) => {
                tracing::warn!(backend = store.backend_name(), error = %e, "Expiry sweep failed");
                store.publish_error("clear_expired", &e);
            },
        }
    }
}
