//! Binance spot REST adapter.

use serde_json::{json, Value};

use super::{get_json, http_client, now_millis, VenueClient};
use crate::errors::VenueError;
use crate::models::VenueCredentials;

const BASE_URL: &str = "https://api.binance.com";

pub struct BinanceVenue {
    symbols: Vec<String>,
    http: reqwest::blocking::Client,
    // Public market data needs no signing; kept for parity with the venue
    // client contract.
    #[allow(dead_code)]
    credentials: VenueCredentials,
}

impl BinanceVenue {
    pub fn new(symbols: Vec<String>, credentials: VenueCredentials) -> Result<Self, VenueError> {
        Ok(Self {
            symbols,
            http: http_client()?,
            credentials,
        })
    }

    /// `BTC/USDT` -> `BTCUSDT`
    fn native_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }
}

impl VenueClient for BinanceVenue {
    fn name(&self) -> &str {
        "binance"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn fetch_ticker(&self, symbol: &str) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v3/ticker/24hr", BASE_URL),
            &[("symbol", Self::native_symbol(symbol))],
        )?;

        Ok(json!({
            "symbol": symbol,
            "last": raw.get("lastPrice").and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok()),
            "timestamp": raw.get("closeTime").cloned().unwrap_or_else(|| json!(now_millis())),
            "info": raw,
        }))
    }

    fn fetch_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Value>, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v3/trades", BASE_URL),
            &[
                ("symbol", Self::native_symbol(symbol)),
                ("limit", limit.unwrap_or(50).to_string()),
            ],
        )?;

        let Value::Array(items) = raw else {
            return Err(VenueError::Exchange("trades payload was not an array".into()));
        };

        Ok(items
            .into_iter()
            .map(|item| {
                // The buyer being the maker means the aggressor sold.
                let side = match item.get("isBuyerMaker").and_then(Value::as_bool) {
                    Some(true) => "sell",
                    Some(false) => "buy",
                    None => "",
                };
                json!({
                    "id": item.get("id").cloned().unwrap_or(Value::Null),
                    "symbol": symbol,
                    "price": item.get("price").cloned().unwrap_or(Value::Null),
                    "amount": item.get("qty").cloned().unwrap_or(Value::Null),
                    "side": side,
                    "timestamp": item.get("time").cloned().unwrap_or(Value::Null),
                })
            })
            .collect())
    }

    fn fetch_book(&self, symbol: &str, limit: Option<u32>) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v3/depth", BASE_URL),
            &[
                ("symbol", Self::native_symbol(symbol)),
                ("limit", limit.unwrap_or(100).to_string()),
            ],
        )?;

        Ok(json!({
            "symbol": symbol,
            "nonce": raw.get("lastUpdateId").cloned().unwrap_or(Value::Null),
            "bids": raw.get("bids").cloned().unwrap_or_else(|| json!([])),
            "asks": raw.get("asks").cloned().unwrap_or_else(|| json!([])),
            "timestamp": now_millis(),
        }))
    }

    fn load_markets(&self) -> Result<Value, VenueError> {
        get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v3/exchangeInfo", BASE_URL),
            &[],
        )
    }
}
