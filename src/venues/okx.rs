//! OKX spot REST adapter.

use serde_json::{json, Value};

use super::{get_json, http_client, VenueClient};
use crate::errors::VenueError;
use crate::models::VenueCredentials;

const BASE_URL: &str = "https://www.okx.com";

pub struct OkxVenue {
    symbols: Vec<String>,
    http: reqwest::blocking::Client,
    #[allow(dead_code)]
    credentials: VenueCredentials,
}

impl OkxVenue {
    pub fn new(symbols: Vec<String>, credentials: VenueCredentials) -> Result<Self, VenueError> {
        Ok(Self {
            symbols,
            http: http_client()?,
            credentials,
        })
    }

    /// `BTC/USDT` -> `BTC-USDT`
    fn native_symbol(symbol: &str) -> String {
        symbol.replace('/', "-")
    }

    /// OKX wraps everything in `{code, msg, data}`; non-zero codes are
    /// exchange-signalled errors.
    fn unwrap_data(&self, raw: Value) -> Result<Vec<Value>, VenueError> {
        let code = raw.get("code").and_then(Value::as_str).unwrap_or("");
        if code != "0" {
            let msg = raw.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            return Err(VenueError::Exchange(format!("okx code {}: {}", code, msg)));
        }
        match raw.get("data") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(VenueError::Exchange("okx response missing data".into())),
        }
    }
}

/// OKX sends epoch milliseconds as strings.
fn ts_number(item: &Value) -> Value {
    item.get("ts")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .map(|v| json!(v))
        .unwrap_or(Value::Null)
}

impl VenueClient for OkxVenue {
    fn name(&self) -> &str {
        "okx"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn fetch_ticker(&self, symbol: &str) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v5/market/ticker", BASE_URL),
            &[("instId", Self::native_symbol(symbol))],
        )?;
        let data = self.unwrap_data(raw)?;
        let item = data
            .first()
            .ok_or_else(|| VenueError::Exchange("okx ticker data empty".into()))?;

        Ok(json!({
            "symbol": symbol,
            "last": item.get("last").and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok()),
            "timestamp": ts_number(item),
            "info": item,
        }))
    }

    fn fetch_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Value>, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v5/market/trades", BASE_URL),
            &[
                ("instId", Self::native_symbol(symbol)),
                ("limit", limit.unwrap_or(50).to_string()),
            ],
        )?;

        Ok(self
            .unwrap_data(raw)?
            .into_iter()
            .map(|item| {
                json!({
                    "trade_id": item.get("tradeId").cloned().unwrap_or(Value::Null),
                    "symbol": symbol,
                    "price": item.get("px").cloned().unwrap_or(Value::Null),
                    "amount": item.get("sz").cloned().unwrap_or(Value::Null),
                    "side": item.get("side").cloned().unwrap_or(Value::Null),
                    "timestamp": ts_number(&item),
                })
            })
            .collect())
    }

    fn fetch_book(&self, symbol: &str, limit: Option<u32>) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v5/market/books", BASE_URL),
            &[
                ("instId", Self::native_symbol(symbol)),
                ("sz", limit.unwrap_or(100).to_string()),
            ],
        )?;
        let data = self.unwrap_data(raw)?;
        let item = data
            .first()
            .ok_or_else(|| VenueError::Exchange("okx book data empty".into()))?;

        // Levels arrive as [px, sz, liquidatedOrders, orderCount]; the
        // normalizer takes the first two fields.
        Ok(json!({
            "symbol": symbol,
            "bids": item.get("bids").cloned().unwrap_or_else(|| json!([])),
            "asks": item.get("asks").cloned().unwrap_or_else(|| json!([])),
            "timestamp": ts_number(item),
        }))
    }

    fn load_markets(&self) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v5/public/instruments", BASE_URL),
            &[("instType", "SPOT".to_string())],
        )?;
        Ok(Value::Array(self.unwrap_data(raw)?))
    }
}
