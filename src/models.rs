use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single executed transaction at a venue, in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub source: String,
    /// Canonical symbol, `BASE/QUOTE`.
    pub instrument: String,
    pub trade_id: Option<String>,
    pub price: f64,
    pub size: f64,
    pub side: Option<String>,
    /// Venue-reported time. Serialized as `timestamp`, the wire name every
    /// canonical event carries.
    #[serde(rename = "timestamp")]
    pub ts: DateTime<Utc>,
    /// Server ingest time.
    pub received_at: DateTime<Utc>,
}

/// Aggregated limit order book as two sorted price ladders.
///
/// Persisted as one row per `(source, instrument)`; the repo upserts in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSnapshot {
    pub source: String,
    pub instrument: String,
    /// Venue update id, when the venue exposes one.
    pub sequence: Option<u64>,
    /// Bids sorted by price descending (best bid first).
    pub bids: Vec<[f64; 2]>,
    /// Asks sorted by price ascending (best ask first).
    pub asks: Vec<[f64; 2]>,
    #[serde(rename = "timestamp")]
    pub ts: DateTime<Utc>,
}

impl BookSnapshot {
    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l[0])
    }

    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l[0])
    }

    /// A crossed book (bid >= ask) is an invalid state and forces a resync
    /// upstream in the depth engine.
    #[inline]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }
}

/// Messages a streaming client may send on `/ws/feeds`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsClientMessage {
    pub action: WsAction,
    pub instrument: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsAction {
    Subscribe,
    Unsubscribe,
}

/// Opaque venue credential record, passed through to the venue client.
#[derive(Debug, Clone, Default)]
pub struct VenueCredentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub redis_url: String,
    pub port: u16,
    pub data_dir: String,
    pub debug: bool,
    pub sandbox_mode: bool,
    pub venues: Vec<String>,
    pub symbols: Vec<String>,
    /// Ticker poll interval, seconds (`REFRESH_INTERVAL`).
    pub refresh_interval: u64,
    pub trades_poll_interval: u64,
    pub books_poll_interval: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = database_path_from_url(
            &std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:///./nexusfeed.db".to_string()),
        );

        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| {
            let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
            let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
            let db = std::env::var("REDIS_DB").unwrap_or_else(|_| "0".to_string());
            format!("redis://{}:{}/{}", host, port, db)
        });

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .unwrap_or(8000);

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let debug = env_flag("DEBUG", false);
        let sandbox_mode = env_flag("SANDBOX_MODE", false);

        let venues = csv_env("VENUES", "binance,deribit");
        let symbols = csv_env("SYMBOLS", "BTC/USDT,ETH/USDT");

        let refresh_interval = env_u64("REFRESH_INTERVAL", 5);
        let trades_poll_interval = env_u64("TRADES_POLL_INTERVAL", 2);
        let books_poll_interval = env_u64("BOOKS_POLL_INTERVAL", 5);
        let batch_size = env_u64("BATCH_SIZE", 100) as usize;
        let flush_interval_ms = env_u64("FLUSH_INTERVAL_MS", 1000);

        Ok(Self {
            database_path,
            redis_url,
            port,
            data_dir,
            debug,
            sandbox_mode,
            venues,
            symbols,
            refresh_interval,
            trades_poll_interval,
            books_poll_interval,
            batch_size,
            flush_interval_ms,
        })
    }

    /// Credentials from `{VENUE}_API_KEY` / `{VENUE}_API_SECRET`.
    pub fn venue_credentials(venue: &str) -> VenueCredentials {
        let prefix = venue.to_uppercase();
        VenueCredentials {
            api_key: std::env::var(format!("{}_API_KEY", prefix)).ok(),
            api_secret: std::env::var(format!("{}_API_SECRET", prefix)).ok(),
        }
    }
}

/// Strip `sqlite`-style URL prefixes down to a filesystem path.
fn database_path_from_url(url: &str) -> String {
    for prefix in ["sqlite+aiosqlite:///", "sqlite:///", "sqlite://"] {
        if let Some(rest) = url.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    url.to_string()
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn csv_env(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_prefixes_strip_to_paths() {
        assert_eq!(
            database_path_from_url("sqlite+aiosqlite:///./nexusfeed.db"),
            "./nexusfeed.db"
        );
        assert_eq!(database_path_from_url("sqlite:///data/x.db"), "data/x.db");
        assert_eq!(database_path_from_url("./plain.db"), "./plain.db");
    }

    #[test]
    fn crossed_book_detection() {
        let mut snap = BookSnapshot {
            source: "sim".into(),
            instrument: "BTC/USDT".into(),
            sequence: Some(1),
            bids: vec![[35000.0, 1.0]],
            asks: vec![[35010.0, 1.0]],
            ts: Utc::now(),
        };
        assert!(!snap.is_crossed());
        snap.bids[0][0] = 35011.0;
        assert!(snap.is_crossed());
        snap.asks.clear();
        assert!(!snap.is_crossed());
    }
}
