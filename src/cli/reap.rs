//! `kvbridge reap`.

use crate::config::StoreConfig;
use crate::observability::install_prometheus;
use crate::storage::{KeyValueStore, open_store};
use crate::{Error, Result};
use clap::Args;
use std::net::SocketAddr;
use std::time::Duration;

/// Arguments of `kvbridge reap`.
#[derive(Debug, Args)]
pub struct ReapArgs {
    /// Connection URI; falls back to the config file.
    #[arg(long, env = "KVBRIDGE_URI", hide_env_values = true)]
    pub uri: Option<String>,

    /// Table, collection or bucket name.
    #[arg(long)]
    pub table: Option<String>,

    /// Namespace used for logging and events; expiry is not scoped.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Repeat every N seconds until interrupted.
    #[arg(long, value_name = "SECS")]
    pub watch: Option<u64>,

    /// Expose Prometheus metrics on this address while watching.
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl ReapArgs {
    /// Merges the flags over a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when neither the flags nor the
    /// configuration provide a URI.
    pub fn store_config(&self, base: Option<StoreConfig>) -> Result<StoreConfig> {
        let mut config = match (base, &self.uri) {
            (Some(base), Some(uri)) => base.with_uri(uri.clone()),
            (Some(base), None) => base,
            (None, Some(uri)) => StoreConfig::new(uri.clone()),
            (None, None) => {
                return Err(Error::InvalidInput(
                    "no connection URI: pass --uri, set KVBRIDGE_URI or use a config file"
                        .to_string(),
                ));
            },
        };
        if let Some(table) = &self.table {
            config.table.clone_from(table);
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = Some(namespace.clone());
        }
        // The command drives sweeps itself.
        config.clear_expired_interval = None;
        Ok(config)
    }
}

/// Totals of a reap run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Sweeps performed.
    pub sweeps: u64,
    /// Entries removed across all sweeps.
    pub removed: u64,
}

/// Runs one sweep, or sweeps every `--watch` seconds until Ctrl-C.
///
/// In watch mode a failed sweep is logged and the loop continues.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the metrics exporter
/// cannot be installed, or a one-shot sweep fails. The pool is released
/// before a sweep error is returned.
pub async fn run_reap(args: &ReapArgs, config: StoreConfig) -> Result<ReapSummary> {
    let store = open_store(config).await?;
    let mut summary = ReapSummary::default();

    let Some(secs) = args.watch.filter(|s| *s > 0) else {
        let swept = store.clear_expired().await;
        store.disconnect().await?;
        summary.removed = swept?;
        summary.sweeps = 1;
        return Ok(summary);
    };

    if let Some(addr) = args.metrics_addr {
        install_prometheus(addr)?;
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(
        backend = store.backend_name(),
        interval_secs = secs,
        "Watching for expired entries"
    );
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Interrupted, stopping reaper");
                break;
            }
            _ = ticker.tick() => {
                summary.sweeps += 1;
                match store.clear_expired().await {
                    Ok(removed) => summary.removed += removed,
                    Err(e) => tracing::warn!(error = %e, "Reap sweep failed"),
                }
            }
        }
    }

    store.disconnect().await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Payload;

    fn args(uri: Option<&str>) -> ReapArgs {
        ReapArgs {
            uri: uri.map(str::to_string),
            table: None,
            namespace: Some("jobs".to_string()),
            watch: None,
            metrics_addr: None,
        }
    }

    #[test]
    fn test_store_config_requires_uri() {
        assert!(matches!(
            args(None).store_config(None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_store_config_flag_overrides_base() {
        let base = StoreConfig::new("sqlite://base.db")
            .with_table("cache")
            .with_clear_expired_interval(Duration::from_secs(5));
        let config = args(Some("sqlite://flag.db"))
            .store_config(Some(base))
            .unwrap();
        assert_eq!(config.uri(), "sqlite://flag.db");
        assert_eq!(config.table, "cache");
        assert_eq!(config.namespace.as_deref(), Some("jobs"));
        assert_eq!(config.clear_expired_interval, None);
    }

    #[tokio::test]
    async fn test_run_reap_once() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().display());
        let config = args(Some(&uri)).store_config(None).unwrap();

        let seed = open_store(config.clone()).await.unwrap();
        seed.set("old", Payload::from(r#"{"value":1,"expires":1}"#))
            .await
            .unwrap();
        seed.set("new", Payload::from(r#"{"value":2}"#)).await.unwrap();

        let summary = run_reap(&args(Some(&uri)), config.clone()).await.unwrap();
        assert_eq!(summary, ReapSummary { sweeps: 1, removed: 1 });
    }

    #[tokio::test]
    async fn test_run_reap_once_releases_pool_on_failure() {
        use crate::storage::global_pools;

        // A regular file where the bucket root should be fails the bootstrap.
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"").unwrap();
        let uri = format!("file://{}", root.display());
        let config = args(Some(&uri)).store_config(None).unwrap();

        let shared = global_pools().acquire(&config).await.unwrap();
        let result = run_reap(&args(Some(&uri)), config).await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
        assert!(shared.is_closed());
    }
}
