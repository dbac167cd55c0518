//! End-to-end pipeline test: simulated venue -> pollers -> normalizer ->
//! storage + fan-out.

use std::sync::Arc;
use std::time::Duration;

use nexusfeed_backend::{
    feed::{FeedConfig, FeedManager},
    publisher::Publisher,
    storage::{BookCache, Repo},
    venues::SimulatedVenue,
};

#[tokio::test]
async fn simulated_feed_reaches_storage_and_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(
        Repo::new(
            dir.path().join("pipeline.db").to_str().unwrap(),
            10,
            Duration::from_millis(50),
        )
        .unwrap(),
    );
    let publisher = Publisher::spawn(1000);
    let manager = FeedManager::new(
        repo.clone(),
        Arc::new(BookCache::disabled()),
        publisher.clone(),
        None,
        FeedConfig {
            trades_poll_interval: Duration::from_millis(50),
            books_poll_interval: Duration::from_millis(50),
            ticker_poll_interval: Duration::from_millis(500),
            trade_fetch_limit: 5,
            book_depth: 5,
        },
    );

    manager.register(Arc::new(SimulatedVenue::new(
        "sim",
        vec!["BTC/USDT".to_string()],
    )));

    // Subscribe with the `-` wire variant; delivered events must carry the
    // canonical form.
    let (client, mut rx) = publisher.register();
    publisher.subscribe(client, "BTC-USDT");

    manager.start_all();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_trade = false;
    let mut saw_book = false;
    while (!saw_trade || !saw_book) && tokio::time::Instant::now() < deadline {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            assert_eq!(event["instrument"], "BTC/USDT");
            assert_eq!(event["source"], "sim");
            if event.get("bids").is_some() {
                saw_book = true;
            } else {
                saw_trade = true;
            }
        }
    }
    assert!(saw_trade, "no trade event delivered");
    assert!(saw_book, "no book event delivered");

    manager.stop_all().await.unwrap();

    assert!(repo.trade_count().unwrap() >= 1);
    let snap = repo
        .latest_snapshot("BTC/USDT")
        .unwrap()
        .expect("book snapshot persisted");
    assert_eq!(snap.source, "sim");
    assert!(!snap.bids.is_empty());
    assert!(!snap.asks.is_empty());

    publisher.stop();
}

#[tokio::test]
async fn stop_all_flushes_residual_trades() {
    let dir = tempfile::tempdir().unwrap();
    // Large batch and long flush interval: only shutdown can commit.
    let repo = Arc::new(
        Repo::new(
            dir.path().join("flush.db").to_str().unwrap(),
            10_000,
            Duration::from_secs(3600),
        )
        .unwrap(),
    );
    let publisher = Publisher::spawn(1000);
    let manager = FeedManager::new(
        repo.clone(),
        Arc::new(BookCache::disabled()),
        publisher.clone(),
        None,
        FeedConfig {
            trades_poll_interval: Duration::from_millis(50),
            books_poll_interval: Duration::from_millis(50),
            ticker_poll_interval: Duration::from_millis(500),
            trade_fetch_limit: 5,
            book_depth: 5,
        },
    );
    manager.register(Arc::new(SimulatedVenue::new(
        "sim",
        vec!["BTC/USDT".to_string()],
    )));
    manager.start_all();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(repo.trade_count().unwrap(), 0, "nothing should flush early");

    manager.stop_all().await.unwrap();
    assert!(
        repo.trade_count().unwrap() >= 1,
        "shutdown must flush the residual batch"
    );

    publisher.stop();
}
