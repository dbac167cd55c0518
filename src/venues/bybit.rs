//! Bybit spot REST adapter (v5 unified market endpoints).

use serde_json::{json, Value};

use super::{get_json, http_client, VenueClient};
use crate::errors::VenueError;
use crate::models::VenueCredentials;

const BASE_URL: &str = "https://api.bybit.com";

pub struct BybitVenue {
    symbols: Vec<String>,
    http: reqwest::blocking::Client,
    #[allow(dead_code)]
    credentials: VenueCredentials,
}

impl BybitVenue {
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

    fn unwrap_result(&self, raw: Value) -> Result<Value, VenueError> {
        let code = raw.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = raw
                .get("retMsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(VenueError::Exchange(format!("bybit code {}: {}", code, msg)));
        }
        raw.get("result")
            .cloned()
            .ok_or_else(|| VenueError::Exchange("bybit response missing result".into()))
    }
}

fn millis_number(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Number(n)) => Value::Number(n.clone()),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

impl VenueClient for BybitVenue {
    fn name(&self) -> &str {
        "bybit"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn fetch_ticker(&self, symbol: &str) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/v5/market/tickers", BASE_URL),
            &[
                ("category", "spot".to_string()),
                ("symbol", Self::native_symbol(symbol)),
            ],
        )?;
        let server_time = millis_number(raw.get("time"));
        let result = self.unwrap_result(raw)?;
        let item = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .cloned()
            .ok_or_else(|| VenueError::Exchange("bybit ticker list empty".into()))?;

        Ok(json!({
            "symbol": symbol,
            "last": item.get("lastPrice").and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok()),
            "timestamp": server_time,
            "info": item,
        }))
    }

    fn fetch_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Value>, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/v5/market/recent-trade", BASE_URL),
            &[
                ("category", "spot".to_string()),
                ("symbol", Self::native_symbol(symbol)),
                ("limit", limit.unwrap_or(50).to_string()),
            ],
        )?;
        let result = self.unwrap_result(raw)?;
        let list = result
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(list
            .into_iter()
            .map(|item| {
                let side = item
                    .get("side")
                    .and_then(Value::as_str)
                    .map(|s| s.to_lowercase())
                    .unwrap_or_default();
                json!({
                    "trade_id": item.get("execId").cloned().unwrap_or(Value::Null),
                    "symbol": symbol,
                    "price": item.get("price").cloned().unwrap_or(Value::Null),
                    "size": item.get("size").cloned().unwrap_or(Value::Null),
                    "side": side,
                    "timestamp": millis_number(item.get("time")),
                })
            })
            .collect())
    }

    fn fetch_book(&self, symbol: &str, limit: Option<u32>) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/v5/market/orderbook", BASE_URL),
            &[
                ("category", "spot".to_string()),
                ("symbol", Self::native_symbol(symbol)),
                ("limit", limit.unwrap_or(50).to_string()),
            ],
        )?;
        let result = self.unwrap_result(raw)?;

        Ok(json!({
            "symbol": symbol,
            "nonce": result.get("u").cloned().unwrap_or(Value::Null),
            "bids": result.get("b").cloned().unwrap_or_else(|| json!([])),
            "asks": result.get("a").cloned().unwrap_or_else(|| json!([])),
            "timestamp": millis_number(result.get("ts")),
        }))
    }

    fn load_markets(&self) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/v5/market/instruments-info", BASE_URL),
            &[("category", "spot".to_string())],
        )?;
        self.unwrap_result(raw)
    }
}
