//! Feed manager and per-stream pollers.
//!
//! For every registered venue x configured symbol the manager runs three
//! cooperative tasks (ticker, trades, book). Each one offloads the venue's
//! blocking fetch to the worker pool, feeds the result into the ingest path
//! and sleeps its stream interval; failures back off independently per
//! (stream, symbol) so one broken stream never delays the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::books::{DepthBookEngine, DepthDelta, SnapshotFetcher};
use crate::errors::VenueError;
use crate::metrics::MESSAGES_RECEIVED_TOTAL;
use crate::models::BookSnapshot;
use crate::normalizer::{self, coerce_timestamp, normalize_book, normalize_trade};
use crate::publisher::Publisher;
use crate::recorder::RawRecorder;
use crate::storage::{BookCache, Repo};
use crate::venues::VenueClient;

const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_INITIAL: Duration = Duration::from_secs(3);

/// Stream intervals and fetch depths.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub trades_poll_interval: Duration,
    pub books_poll_interval: Duration,
    /// `REFRESH_INTERVAL`.
    pub ticker_poll_interval: Duration,
    pub trade_fetch_limit: u32,
    pub book_depth: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            trades_poll_interval: Duration::from_secs(2),
            books_poll_interval: Duration::from_secs(5),
            ticker_poll_interval: Duration::from_secs(5),
            trade_fetch_limit: 50,
            book_depth: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Ticker,
    Trades,
    Book,
}

impl StreamKind {
    fn as_str(self) -> &'static str {
        match self {
            StreamKind::Ticker => "ticker",
            StreamKind::Trades => "trades",
            StreamKind::Book => "book",
        }
    }
}

enum Fetched {
    Ticker(Value),
    Trades(Vec<Value>),
    Book(Value),
}

/// Per-(stream, symbol) adaptive back-off: 3s on the first failure (3-10s
/// randomized for throttle-class errors), doubling per consecutive failure,
/// capped at 60s, reset on success.
struct PollBackoff {
    failures: u32,
    delay: Duration,
}

impl PollBackoff {
    fn new() -> Self {
        Self {
            failures: 0,
            delay: Duration::ZERO,
        }
    }

    fn on_failure(&mut self, err: &VenueError) -> Duration {
        self.failures += 1;
        self.delay = if self.failures == 1 {
            if err.is_throttle() {
                Duration::from_secs_f64(rand::thread_rng().gen_range(3.0..10.0))
            } else {
                BACKOFF_INITIAL
            }
        } else {
            (self.delay * 2).min(BACKOFF_CAP)
        };
        self.delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.delay = Duration::ZERO;
    }
}

/// Owns the venue set and routes normalized events into persistence, the hot
/// cache and the publisher.
pub struct FeedManager {
    venues: parking_lot::Mutex<Vec<Arc<dyn VenueClient>>>,
    depth_engines: parking_lot::Mutex<HashMap<String, Arc<DepthBookEngine>>>,
    repo: Arc<Repo>,
    cache: Arc<BookCache>,
    publisher: Arc<Publisher>,
    recorder: Option<Arc<RawRecorder>>,
    config: FeedConfig,
    stop_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl FeedManager {
    pub fn new(
        repo: Arc<Repo>,
        cache: Arc<BookCache>,
        publisher: Arc<Publisher>,
        recorder: Option<Arc<RawRecorder>>,
        config: FeedConfig,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            venues: parking_lot::Mutex::new(Vec::new()),
            depth_engines: parking_lot::Mutex::new(HashMap::new()),
            repo,
            cache,
            publisher,
            recorder,
            config,
            stop_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Register a venue and give it a depth engine seeded from its own book
    /// endpoint.
    pub fn register(&self, venue: Arc<dyn VenueClient>) {
        let fetcher = snapshot_fetcher(venue.clone(), self.config.book_depth);
        let engine = Arc::new(DepthBookEngine::new(venue.name(), fetcher));
        self.depth_engines
            .lock()
            .insert(venue.name().to_string(), engine);
        self.venues.lock().push(venue);
    }

    pub fn venues(&self) -> Vec<Arc<dyn VenueClient>> {
        self.venues.lock().clone()
    }

    pub fn venue(&self, name: &str) -> Option<Arc<dyn VenueClient>> {
        self.venues
            .lock()
            .iter()
            .find(|v| v.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Launch ticker, trades and book pollers for every venue x symbol.
    pub fn start_all(self: &Arc<Self>) {
        let venues = self.venues.lock().clone();
        let mut tasks = self.tasks.lock();

        for venue in venues {
            for symbol in venue.symbols().to_vec() {
                for kind in [StreamKind::Ticker, StreamKind::Trades, StreamKind::Book] {
                    let manager = self.clone();
                    let venue = venue.clone();
                    let symbol = symbol.clone();
                    tasks.push(tokio::spawn(async move {
                        manager.poll_loop(venue, symbol, kind).await;
                    }));
                }
            }
        }

        info!("feed manager started {} pollers", tasks.len());
    }

    /// Signal stop, await every poller, then flush and close the repo.
    pub async fn stop_all(&self) -> Result<()> {
        let _ = self.stop_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.repo.shutdown().await
    }

    async fn poll_loop(self: Arc<Self>, venue: Arc<dyn VenueClient>, symbol: String, kind: StreamKind) {
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = match kind {
            StreamKind::Ticker => self.config.ticker_poll_interval,
            StreamKind::Trades => self.config.trades_poll_interval,
            StreamKind::Book => self.config.books_poll_interval,
        };
        let mut backoff = PollBackoff::new();
        let source = venue.name().to_string();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let fetch = {
                let venue = venue.clone();
                let symbol = symbol.clone();
                let config = self.config.clone();
                tokio::task::spawn_blocking(move || match kind {
                    StreamKind::Ticker => venue.fetch_ticker(&symbol).map(Fetched::Ticker),
                    StreamKind::Trades => venue
                        .fetch_trades(&symbol, Some(config.trade_fetch_limit))
                        .map(Fetched::Trades),
                    StreamKind::Book => venue
                        .fetch_book(&symbol, Some(config.book_depth))
                        .map(Fetched::Book),
                })
            };

            let delay = match fetch.await {
                Ok(Ok(result)) => {
                    self.dispatch(result, &source, &symbol).await;
                    if backoff.failures > 0 {
                        debug!(
                            venue = %source,
                            symbol = %symbol,
                            stream = kind.as_str(),
                            "stream recovered"
                        );
                    }
                    backoff.reset();
                    interval
                }
                Ok(Err(e)) => {
                    let delay = backoff.on_failure(&e);
                    if backoff.failures == 1 {
                        warn!(
                            venue = %source,
                            symbol = %symbol,
                            stream = kind.as_str(),
                            "fetch failed, backing off {:?}: {}",
                            delay,
                            e
                        );
                    } else {
                        error!(
                            venue = %source,
                            symbol = %symbol,
                            stream = kind.as_str(),
                            failures = backoff.failures,
                            "fetch failed, backing off {:?}: {}",
                            delay,
                            e
                        );
                    }
                    delay
                }
                Err(join_err) => {
                    error!(
                        venue = %source,
                        symbol = %symbol,
                        stream = kind.as_str(),
                        "fetch task aborted: {}",
                        join_err
                    );
                    interval
                }
            };

            if !sleep_or_stop(&mut stop_rx, delay).await {
                break;
            }
        }

        debug!(venue = %source, symbol = %symbol, stream = kind.as_str(), "poller exited");
    }

    async fn dispatch(&self, fetched: Fetched, source: &str, symbol: &str) {
        match fetched {
            Fetched::Ticker(raw) => self.ingest_ticker(&raw, source, symbol).await,
            Fetched::Trades(raws) => {
                for raw in raws {
                    self.ingest_trade(&raw, source).await;
                }
            }
            Fetched::Book(raw) => self.ingest_book(&raw, source).await,
        }
    }

    /// Normalize, persist and fan out one trade.
    pub async fn ingest_trade(&self, raw: &Value, source: &str) {
        let trade = match normalize_trade(raw, source) {
            Ok(trade) => trade,
            Err(e) => {
                warn!(venue = %source, "dropping malformed trade payload: {}", e);
                return;
            }
        };

        if let Err(e) = self.repo.insert_trade(trade.clone()) {
            warn!(
                venue = %source,
                instrument = %trade.instrument,
                "trade persist failed: {:#}",
                e
            );
        }
        metrics::counter!(MESSAGES_RECEIVED_TOTAL, 1, "type" => "trade");

        match serde_json::to_value(&trade) {
            Ok(event) => self.publisher.publish(event).await,
            Err(e) => warn!("trade encode failed: {}", e),
        }
    }

    /// Normalize one full book and run it through persist/cache/publish.
    pub async fn ingest_book(&self, raw: &Value, source: &str) {
        let snap = match normalize_book(raw, source) {
            Ok(snap) => snap,
            Err(e) => {
                warn!(venue = %source, "dropping malformed book payload: {}", e);
                return;
            }
        };
        self.publish_book(snap).await;
    }

    /// Route a sequenced depth delta through the venue's book engine; when it
    /// applies, the merged book flows down the normal book ingest path.
    pub async fn ingest_depth_delta(
        &self,
        source: &str,
        symbol: &str,
        delta: DepthDelta,
    ) -> Result<bool> {
        let engine = self
            .depth_engines
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow!("no depth engine for venue {}", source))?;

        let (applied, view) = {
            let symbol = symbol.to_string();
            tokio::task::spawn_blocking(move || {
                let applied = engine.apply_delta(&symbol, &delta)?;
                let view = if applied { engine.get_book(&symbol) } else { None };
                Ok::<_, VenueError>((applied, view))
            })
            .await??
        };

        if let Some(view) = view {
            self.publish_book(BookSnapshot {
                source: source.to_string(),
                instrument: symbol.to_string(),
                sequence: view.sequence,
                bids: view.bids,
                asks: view.asks,
                ts: Utc::now(),
            })
            .await;
        }
        Ok(applied)
    }

    /// Log the last price and append it to the venue's raw capture file.
    async fn ingest_ticker(&self, raw: &Value, source: &str, symbol: &str) {
        let price = last_price(raw);
        info!(
            "[{}] {} price: {}",
            source.to_uppercase(),
            symbol,
            price.map(|p| p.to_string()).unwrap_or_else(|| "n/a".into())
        );

        if let Some(recorder) = &self.recorder {
            let recorder = recorder.clone();
            let ts = coerce_timestamp(raw.get("timestamp").or_else(|| raw.get("datetime")));
            let venue = source.to_string();
            let symbol = symbol.to_string();
            let result = tokio::task::spawn_blocking(move || {
                recorder.append_ticker(&venue, &symbol, price, ts)
            })
            .await;
            if let Ok(Err(e)) = result {
                warn!(venue = %source, "ticker capture failed: {:#}", e);
            }
        }
    }

    async fn publish_book(&self, snap: BookSnapshot) {
        if let Err(e) = self.repo.upsert_snapshot(&snap) {
            warn!(
                source = %snap.source,
                instrument = %snap.instrument,
                "snapshot persist failed: {:#}",
                e
            );
        }

        self.cache.set_snapshot(&snap.instrument, &snap).await;
        metrics::counter!(MESSAGES_RECEIVED_TOTAL, 1, "type" => "book");

        match serde_json::to_value(&snap) {
            Ok(event) => self.publisher.publish(event).await,
            Err(e) => warn!("snapshot encode failed: {}", e),
        }
    }
}

/// Seed a depth engine from the venue's own (blocking) book endpoint.
fn snapshot_fetcher(venue: Arc<dyn VenueClient>, depth: u32) -> SnapshotFetcher {
    Box::new(move |symbol| {
        let raw = venue.fetch_book(symbol, Some(depth))?;
        let last_update_id = raw
            .get("nonce")
            .and_then(Value::as_u64)
            .ok_or_else(|| VenueError::Exchange("book snapshot missing sequence".into()))?;
        let bids = normalizer::parse_levels(raw.get("bids"))
            .map_err(|e| VenueError::Exchange(e.to_string()))?;
        let asks = normalizer::parse_levels(raw.get("asks"))
            .map_err(|e| VenueError::Exchange(e.to_string()))?;
        Ok(crate::books::DepthSnapshot {
            last_update_id,
            bids,
            asks,
        })
    })
}

fn last_price(raw: &Value) -> Option<f64> {
    for key in ["last", "close"] {
        match raw.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// Sleep for `delay`, returning false if the stop signal fires first.
async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop_rx.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::SimulatedVenue;
    use serde_json::json;
    use std::time::Duration;

    fn throttle() -> VenueError {
        VenueError::RateLimited("429".into())
    }

    fn network() -> VenueError {
        VenueError::Network("connection reset".into())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = PollBackoff::new();

        assert_eq!(backoff.on_failure(&network()), Duration::from_secs(3));
        assert_eq!(backoff.on_failure(&network()), Duration::from_secs(6));
        assert_eq!(backoff.on_failure(&network()), Duration::from_secs(12));

        for _ in 0..8 {
            backoff.on_failure(&network());
        }
        assert_eq!(backoff.delay, BACKOFF_CAP);

        backoff.reset();
        assert_eq!(backoff.failures, 0);
        assert_eq!(backoff.on_failure(&network()), Duration::from_secs(3));
    }

    #[test]
    fn throttle_backoff_is_randomized_in_window() {
        for _ in 0..32 {
            let mut backoff = PollBackoff::new();
            let delay = backoff.on_failure(&throttle());
            assert!(delay >= Duration::from_secs(3) && delay < Duration::from_secs(10));
        }
    }

    async fn test_manager(dir: &tempfile::TempDir) -> Arc<FeedManager> {
        let repo = Arc::new(
            Repo::new(
                dir.path().join("feed.db").to_str().unwrap(),
                100,
                Duration::from_millis(50),
            )
            .unwrap(),
        );
        FeedManager::new(
            repo,
            Arc::new(BookCache::disabled()),
            Publisher::spawn(1000),
            None,
            FeedConfig::default(),
        )
    }

    #[tokio::test]
    async fn ingest_trade_persists_and_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;

        let (client, mut rx) = manager.publisher.register();
        manager.publisher.subscribe(client, "BTC/USDT");

        let raw = json!({
            "id": "1",
            "symbol": "BTC/USDT",
            "price": 35000.0,
            "amount": 0.01,
            "side": "buy",
            "timestamp": 1_609_459_200_000_i64,
        });
        manager.ingest_trade(&raw, "sim").await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event["instrument"], "BTC/USDT");
        assert_eq!(event["source"], "sim");

        manager.stop_all().await.unwrap();
        assert_eq!(manager.repo.trade_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;

        manager.ingest_trade(&json!({"price": 1.0}), "sim").await;
        manager.ingest_book(&json!({"bids": []}), "sim").await;

        manager.stop_all().await.unwrap();
        assert_eq!(manager.repo.trade_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn depth_delta_routes_through_engine_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        manager.register(Arc::new(SimulatedVenue::new(
            "sim",
            vec!["BTC/USDT".to_string()],
        )));

        // The sim venue's snapshot carries nonce 0, so (1, 1) is contiguous.
        let applied = manager
            .ingest_depth_delta(
                "sim",
                "BTC/USDT",
                DepthDelta {
                    first_update_id: Some(1),
                    last_update_id: Some(1),
                    bids: vec![[34999.5, 0.25]],
                    asks: vec![],
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let snap = manager
            .repo
            .latest_snapshot("BTC/USDT")
            .unwrap()
            .expect("merged book persisted");
        assert_eq!(snap.sequence, Some(1));
        assert!(snap.bids.iter().any(|l| l[0] == 34999.5));

        manager.stop_all().await.unwrap();
    }
}
