//! Deterministic venue for sandbox mode and tests.
//!
//! Shapes match what the REST adapters emit, so the whole ingest path runs
//! unchanged against it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use super::{now_millis, VenueClient};
use crate::errors::VenueError;

pub struct SimulatedVenue {
    name: String,
    symbols: Vec<String>,
    tid: AtomicU64,
}

impl SimulatedVenue {
    pub fn new(name: impl Into<String>, symbols: Vec<String>) -> Self {
        let symbols = if symbols.is_empty() {
            vec!["BTC/USDT".to_string()]
        } else {
            symbols
        };
        Self {
            name: name.into(),
            symbols,
            tid: AtomicU64::new(0),
        }
    }
}

impl VenueClient for SimulatedVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn fetch_ticker(&self, symbol: &str) -> Result<Value, VenueError> {
        let tid = self.tid.load(Ordering::Relaxed);
        Ok(json!({
            "symbol": symbol,
            "last": 35000.0 + (tid % 50) as f64,
            "timestamp": now_millis(),
        }))
    }

    fn fetch_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Value>, VenueError> {
        let limit = limit.unwrap_or(5) as usize;
        let now = now_millis();

        let mut out = Vec::with_capacity(limit);
        for i in 0..limit {
            let tid = self.tid.fetch_add(1, Ordering::Relaxed) + 1;
            out.push(json!({
                "id": tid.to_string(),
                "timestamp": now,
                "symbol": symbol,
                "price": 35000.0 + (tid % 50) as f64,
                "amount": 0.01 + (i as f64) * 0.001,
                "side": if tid % 2 == 0 { "buy" } else { "sell" },
            }));
        }
        Ok(out)
    }

    fn fetch_book(&self, symbol: &str, limit: Option<u32>) -> Result<Value, VenueError> {
        let limit = limit.unwrap_or(5) as i64;
        let now = now_millis();
        let nonce = self.tid.load(Ordering::Relaxed);

        let bids: Vec<Value> = (0..limit)
            .map(|i| json!([35000.0 - i as f64, 0.1 + (i as f64) * 0.01]))
            .collect();
        let asks: Vec<Value> = (0..limit)
            .map(|i| json!([35000.5 + i as f64, 0.1 + (i as f64) * 0.01]))
            .collect();

        Ok(json!({
            "symbol": symbol,
            "nonce": nonce,
            "bids": bids,
            "asks": asks,
            "timestamp": now,
        }))
    }

    fn load_markets(&self) -> Result<Value, VenueError> {
        let mut markets = serde_json::Map::new();
        for symbol in &self.symbols {
            markets.insert(symbol.clone(), json!({"active": true}));
        }
        Ok(Value::Object(markets))
    }
}
