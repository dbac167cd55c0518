//! Deribit REST adapter (v2 public endpoints, spot pairs).

use serde_json::{json, Value};

use super::{get_json, http_client, VenueClient};
use crate::errors::VenueError;
use crate::models::VenueCredentials;

const BASE_URL: &str = "https://www.deribit.com";

pub struct DeribitVenue {
    symbols: Vec<String>,
    http: reqwest::blocking::Client,
    #[allow(dead_code)]
    credentials: VenueCredentials,
}

impl DeribitVenue {
    pub fn new(symbols: Vec<String>, credentials: VenueCredentials) -> Result<Self, VenueError> {
        Ok(Self {
            symbols,
            http: http_client()?,
            credentials,
        })
    }

    /// `BTC/USDT` -> `BTC_USDT`
    fn native_symbol(symbol: &str) -> String {
        symbol.replace('/', "_")
    }

    fn unwrap_result(&self, raw: Value) -> Result<Value, VenueError> {
        if let Some(error) = raw.get("error") {
            let msg = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(VenueError::Exchange(format!("deribit: {}", msg)));
        }
        raw.get("result")
            .cloned()
            .ok_or_else(|| VenueError::Exchange("deribit response missing result".into()))
    }
}

impl VenueClient for DeribitVenue {
    fn name(&self) -> &str {
        "deribit"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn fetch_ticker(&self, symbol: &str) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v2/public/ticker", BASE_URL),
            &[("instrument_name", Self::native_symbol(symbol))],
        )?;
        let result = self.unwrap_result(raw)?;

        Ok(json!({
            "symbol": symbol,
            "last": result.get("last_price").cloned().unwrap_or(Value::Null),
            "timestamp": result.get("timestamp").cloned().unwrap_or(Value::Null),
            "info": result,
        }))
    }

    fn fetch_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Value>, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v2/public/get_last_trades_by_instrument", BASE_URL),
            &[
                ("instrument_name", Self::native_symbol(symbol)),
                ("count", limit.unwrap_or(50).to_string()),
            ],
        )?;
        let result = self.unwrap_result(raw)?;
        let trades = result
            .get("trades")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(trades
            .into_iter()
            .map(|item| {
                json!({
                    "trade_id": item.get("trade_id").cloned().unwrap_or(Value::Null),
                    "symbol": symbol,
                    "price": item.get("price").cloned().unwrap_or(Value::Null),
                    "amount": item.get("amount").cloned().unwrap_or(Value::Null),
                    "side": item.get("direction").cloned().unwrap_or(Value::Null),
                    "timestamp": item.get("timestamp").cloned().unwrap_or(Value::Null),
                })
            })
            .collect())
    }

    fn fetch_book(&self, symbol: &str, limit: Option<u32>) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v2/public/get_order_book", BASE_URL),
            &[
                ("instrument_name", Self::native_symbol(symbol)),
                ("depth", limit.unwrap_or(50).to_string()),
            ],
        )?;
        let result = self.unwrap_result(raw)?;

        Ok(json!({
            "symbol": symbol,
            "nonce": result.get("change_id").cloned().unwrap_or(Value::Null),
            "bids": result.get("bids").cloned().unwrap_or_else(|| json!([])),
            "asks": result.get("asks").cloned().unwrap_or_else(|| json!([])),
            "timestamp": result.get("timestamp").cloned().unwrap_or(Value::Null),
        }))
    }

    fn load_markets(&self) -> Result<Value, VenueError> {
        let raw = get_json(
            &self.http,
            self.name(),
            &format!("{}/api/v2/public/get_instruments", BASE_URL),
            &[("currency", "USDT".to_string()), ("kind", "spot".to_string())],
        )?;
        self.unwrap_result(raw)
    }
}
