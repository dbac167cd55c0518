//! NexusFeed - multi-exchange market-data aggregator.
//!
//! Wires the poller set, storage, hot cache, publisher and replay sessions
//! into one axum server, and tears the pipeline down cleanly (pollers first,
//! then a final trade flush) on ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexusfeed_backend::{
    api::{self, AppState},
    feed::{FeedConfig, FeedManager},
    metrics,
    models::Config,
    publisher::Publisher,
    recorder::RawRecorder,
    replay::ReplaySessions,
    storage::{BookCache, Repo},
    venues,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("🚀 NexusFeed starting");

    let config = Config::from_env()?;
    let metrics_handle = metrics::install_recorder()?;

    let repo = Arc::new(
        Repo::new(
            &config.database_path,
            config.batch_size,
            Duration::from_millis(config.flush_interval_ms),
        )
        .context("failed to open storage")?,
    );

    let cache = Arc::new(BookCache::connect(&config.redis_url));
    let publisher = Publisher::spawn(1000);

    let recorder = match RawRecorder::new(&config.data_dir) {
        Ok(recorder) => Some(Arc::new(recorder)),
        Err(e) => {
            warn!("raw ticker capture disabled: {:#}", e);
            None
        }
    };

    let feed_config = FeedConfig {
        trades_poll_interval: Duration::from_secs(config.trades_poll_interval),
        books_poll_interval: Duration::from_secs(config.books_poll_interval),
        ticker_poll_interval: Duration::from_secs(config.refresh_interval),
        ..FeedConfig::default()
    };
    let manager = FeedManager::new(
        repo.clone(),
        cache.clone(),
        publisher.clone(),
        recorder,
        feed_config,
    );

    // Sandbox swaps the whole venue set for the deterministic simulator.
    let venue_ids = if config.sandbox_mode {
        vec!["sim".to_string()]
    } else {
        config.venues.clone()
    };

    for name in venue_ids {
        let symbols = config.symbols.clone();
        let credentials = Config::venue_credentials(&name);
        // Blocking reqwest clients must not be built on the async runtime.
        let built = {
            let name = name.clone();
            tokio::task::spawn_blocking(move || venues::build_venue(&name, symbols, credentials))
                .await
                .context("venue construction task failed")?
        };
        match built {
            Ok(venue) => {
                info!(
                    "📡 registered venue {} ({} symbols)",
                    venue.name(),
                    venue.symbols().len()
                );
                manager.register(venue);
            }
            Err(e) => warn!("skipping venue {}: {}", name, e),
        }
    }

    if manager.venues().is_empty() {
        warn!("no venues registered; serving storage and replay only");
    }

    manager.start_all();

    let sessions = ReplaySessions::new();
    let state = AppState {
        config: config.clone(),
        repo,
        cache,
        publisher: publisher.clone(),
        manager: manager.clone(),
        sessions,
        metrics_handle,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("stopping pollers and flushing storage");
    manager.stop_all().await?;
    publisher.stop();
    info!("shutdown complete");

    Ok(())
}

fn init_tracing() {
    dotenv::dotenv().ok();

    let level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "INFO".to_string())
        .to_lowercase();
    let default_filter = format!(
        "nexusfeed_backend={level},nexusfeed={level},tower_http=warn",
        level = level
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutdown signal received");
}
