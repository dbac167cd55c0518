//! Venue client adapters.
//!
//! Each adapter exposes the same blocking primitives over a venue's public
//! REST API and returns ccxt-shaped raw maps; the normalizer does the rest.
//! Pollers offload these calls to the blocking pool, so nothing here may be
//! called from an async context directly.

pub mod binance;
pub mod bybit;
pub mod deribit;
pub mod okx;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::errors::VenueError;
use crate::models::VenueCredentials;

pub use binance::BinanceVenue;
pub use bybit::BybitVenue;
pub use deribit::DeribitVenue;
pub use okx::OkxVenue;
pub use simulated::SimulatedVenue;

/// Uniform blocking primitives over one venue.
pub trait VenueClient: Send + Sync {
    fn name(&self) -> &str;
    fn symbols(&self) -> &[String];
    fn fetch_ticker(&self, symbol: &str) -> Result<Value, VenueError>;
    fn fetch_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Value>, VenueError>;
    fn fetch_book(&self, symbol: &str, limit: Option<u32>) -> Result<Value, VenueError>;
    fn load_markets(&self) -> Result<Value, VenueError>;
}

/// Construct a venue client by registry id.
pub fn build_venue(
    name: &str,
    symbols: Vec<String>,
    credentials: VenueCredentials,
) -> Result<Arc<dyn VenueClient>, VenueError> {
    match name {
        "binance" => Ok(Arc::new(BinanceVenue::new(symbols, credentials)?)),
        "okx" => Ok(Arc::new(OkxVenue::new(symbols, credentials)?)),
        "bybit" => Ok(Arc::new(BybitVenue::new(symbols, credentials)?)),
        "deribit" => Ok(Arc::new(DeribitVenue::new(symbols, credentials)?)),
        "sim" => Ok(Arc::new(SimulatedVenue::new("sim", symbols))),
        other => Err(VenueError::Unexpected(format!("unknown venue id: {}", other))),
    }
}

pub(crate) fn http_client() -> Result<reqwest::blocking::Client, VenueError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(VenueError::from)
}

/// GET a JSON document, partitioning HTTP failures into the venue taxonomy.
pub(crate) fn get_json(
    http: &reqwest::blocking::Client,
    venue: &str,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value, VenueError> {
    let response = http.get(url).query(query).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(VenueError::from_status(status, venue));
    }
    response.json::<Value>().map_err(VenueError::from)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
