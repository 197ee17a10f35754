//! Main entry point for the ghnotify binary

use anyhow::Context;
use ghnotify::cache::{CacheManager, ManagerOptions, RocksCacheStore};
use ghnotify::cancel::CancelToken;
use ghnotify::sync::{Orchestrator, PipelineConfig, ScopeFilter, SyncRequest};
use ghnotify::transport::{GithubClient, RetryingTransport};
use std::sync::Arc;
use tracing::{error, info, warn};

async fn run(cancel: CancelToken) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();

    if let Ok(addr) = std::env::var("GHNOTIFY_METRICS_ADDR") {
        let addr = addr.parse().context("GHNOTIFY_METRICS_ADDR is not a socket address")?;
        ghnotify::metrics::init_metrics(addr).map_err(|e| anyhow::anyhow!(e))?;
    }

    let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN must be set")?;
    let client = GithubClient::new(&config.api_url, &token)?;
    let transport = Arc::new(RetryingTransport::from_config(client, &config));

    let store = RocksCacheStore::open(&config.cache_dir, config.compaction_interval)
        .with_context(|| format!("failed to open cache at {}", config.cache_dir.display()))?;
    let cache = Arc::new(CacheManager::new(Arc::new(store), ManagerOptions::from_config(&config)));

    let orchestrator = Orchestrator::new(transport, Some(cache.clone()), config);
    let result = orchestrator
        .synchronize(&SyncRequest::new(ScopeFilter::all()), &cancel)
        .await;

    if let Err(e) = cache.close().await {
        warn!(error = %e, "Failed to close cache cleanly");
    }

    let outcome = result?;
    let unread = outcome.items.iter().filter(|n| n.unread).count();
    info!(
        total = outcome.items.len(),
        unread,
        source = outcome.source.as_str(),
        pages = outcome.pages_fetched,
        "Notifications synchronized"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    ghnotify::logging::init();

    let cancel = CancelToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received - cancelling synchronization...");
                cancel.cancel();
            }
        }
    });

    if let Err(e) = run(cancel).await {
        error!("Synchronization failed: {:#}", e);
        std::process::exit(1);
    }
}
