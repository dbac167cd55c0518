//! Normalization layer: heterogeneous venue payloads -> canonical records.
//!
//! Venues disagree on field names (`amount` vs `qty` vs `size`), on numeric
//! encoding (JSON numbers vs decimal strings) and on timestamps (ms vs s vs
//! ISO-8601). Everything funnels through first-of-keys lookups and a single
//! timestamp coercion rule so the rest of the pipeline only ever sees
//! [`Trade`] and [`BookSnapshot`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::errors::NormalizeError;
use crate::models::{BookSnapshot, Trade};

/// First key whose value is present and non-empty, stringified.
fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match raw.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// First key parseable as a real (JSON number or decimal string).
fn first_f64(raw: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| value_as_f64(raw.get(key)?))
}

fn first_u64(raw: &Value, keys: &[&str]) -> Option<u64> {
    for key in keys {
        match raw.get(key) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_u64() {
                    return Some(v);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<u64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce a venue timestamp into a UTC instant.
///
/// Numbers above 1e12 are milliseconds since the epoch, anything else is
/// seconds (fractions allowed). Strings are parsed as ISO-8601, with a
/// trailing `Z` accepted. Absent or unparseable values fall back to now.
pub fn coerce_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        Some(Value::Number(n)) => {
            let v = n.as_f64().unwrap_or(0.0);
            epoch_to_utc(v)
        }
        Some(Value::String(s)) => parse_iso(s).unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

fn epoch_to_utc(v: f64) -> DateTime<Utc> {
    let secs = if v > 1e12 { v / 1000.0 } else { v };
    let whole = secs.trunc() as i64;
    let nanos = (secs.fract() * 1e9).round() as u32;
    DateTime::from_timestamp(whole, nanos).unwrap_or_else(Utc::now)
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Offset-less ISO strings are taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Map a raw venue trade into the canonical record.
pub fn normalize_trade(raw: &Value, source: &str) -> Result<Trade, NormalizeError> {
    let instrument = first_string(raw, &["symbol", "instrument", "pair"])
        .ok_or(NormalizeError::MissingField("instrument"))?;
    let trade_id = first_string(raw, &["id", "trade_id", "tid"]);
    let price = first_f64(raw, &["price"]).ok_or(NormalizeError::MissingField("price"))?;
    let size =
        first_f64(raw, &["amount", "qty", "size"]).ok_or(NormalizeError::MissingField("size"))?;

    if !price.is_finite() || price <= 0.0 {
        return Err(NormalizeError::Invalid(format!("non-positive price {}", price)));
    }
    if !size.is_finite() || size <= 0.0 {
        return Err(NormalizeError::Invalid(format!("non-positive size {}", size)));
    }

    let side = raw
        .get("side")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty());

    let ts = coerce_timestamp(raw.get("timestamp").or_else(|| raw.get("datetime")));

    Ok(Trade {
        source: source.to_string(),
        instrument,
        trade_id,
        price,
        size,
        side,
        ts,
        received_at: Utc::now(),
    })
}

/// Map a raw venue order book into the canonical snapshot.
///
/// Zero-size levels are preserved verbatim; only the depth state machine
/// interprets them as deletes.
pub fn normalize_book(raw: &Value, source: &str) -> Result<BookSnapshot, NormalizeError> {
    let instrument = first_string(raw, &["symbol", "instrument", "pair"])
        .ok_or(NormalizeError::MissingField("instrument"))?;
    let sequence = first_u64(raw, &["nonce", "sequence", "seq"]);

    let bids = parse_levels(raw.get("bids"))?;
    let asks = parse_levels(raw.get("asks"))?;

    let ts = coerce_timestamp(raw.get("timestamp").or_else(|| raw.get("datetime")));

    Ok(BookSnapshot {
        source: source.to_string(),
        instrument,
        sequence,
        bids,
        asks,
        ts,
    })
}

/// Accept `[price, size]` pairs or `{price, size|amount|qty}` objects.
pub fn parse_levels(value: Option<&Value>) -> Result<Vec<[f64; 2]>, NormalizeError> {
    let Some(Value::Array(levels)) = value else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(levels.len());
    for level in levels {
        match level {
            Value::Array(pair) if pair.len() >= 2 => {
                let price = value_as_f64(&pair[0])
                    .ok_or_else(|| NormalizeError::Invalid("unparseable level price".into()))?;
                let size = value_as_f64(&pair[1])
                    .ok_or_else(|| NormalizeError::Invalid("unparseable level size".into()))?;
                out.push([price, size]);
            }
            Value::Object(_) => {
                let price = first_f64(level, &["price"])
                    .ok_or_else(|| NormalizeError::Invalid("level object missing price".into()))?;
                let size = first_f64(level, &["size", "amount", "qty"])
                    .ok_or_else(|| NormalizeError::Invalid("level object missing size".into()))?;
                out.push([price, size]);
            }
            _ => {
                return Err(NormalizeError::Invalid(format!(
                    "unrecognized level shape: {}",
                    level
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn normalize_ccxt_trade() {
        let raw = json!({
            "id": "12345",
            "timestamp": 1_609_459_200_000_i64,
            "datetime": "2021-01-01T00:00:00.000Z",
            "symbol": "BTC/USDT",
            "price": 34000.5,
            "amount": 0.01,
            "side": "buy",
        });

        let out = normalize_trade(&raw, "binance").unwrap();
        assert_eq!(out.source, "binance");
        assert_eq!(out.instrument, "BTC/USDT");
        assert_eq!(out.trade_id.as_deref(), Some("12345"));
        assert_eq!(out.price, 34000.5);
        assert_eq!(out.size, 0.01);
        assert_eq!(out.side.as_deref(), Some("buy"));
        assert_eq!(out.ts, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn normalize_ccxt_book() {
        let raw = json!({
            "symbol": "ETH/USDT",
            "nonce": 987_654_321_u64,
            "bids": [[2000.0, 1.5], [1999.5, 2.0]],
            "asks": [[2000.5, 1.0], [2001.0, 0.8]],
            "timestamp": 1_609_459_200_000_i64,
        });

        let out = normalize_book(&raw, "deribit").unwrap();
        assert_eq!(out.source, "deribit");
        assert_eq!(out.instrument, "ETH/USDT");
        assert_eq!(out.sequence, Some(987_654_321));
        assert_eq!(out.bids, vec![[2000.0, 1.5], [1999.5, 2.0]]);
        assert_eq!(out.asks, vec![[2000.5, 1.0], [2001.0, 0.8]]);
        assert_eq!(out.ts, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn field_fallbacks_and_string_numbers() {
        let raw = json!({
            "pair": "SOL/USDT",
            "tid": 42,
            "price": "19.25",
            "qty": "3.5",
            "timestamp": 1_609_459_200, // seconds
        });

        let out = normalize_trade(&raw, "okx").unwrap();
        assert_eq!(out.instrument, "SOL/USDT");
        assert_eq!(out.trade_id.as_deref(), Some("42"));
        assert_eq!(out.price, 19.25);
        assert_eq!(out.size, 3.5);
        assert_eq!(out.ts, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let no_symbol = json!({"price": 1.0, "amount": 1.0});
        assert_eq!(
            normalize_trade(&no_symbol, "x").unwrap_err(),
            NormalizeError::MissingField("instrument")
        );

        let no_size = json!({"symbol": "BTC/USDT", "price": 1.0});
        assert_eq!(
            normalize_trade(&no_size, "x").unwrap_err(),
            NormalizeError::MissingField("size")
        );

        let no_instrument_book = json!({"bids": [], "asks": []});
        assert_eq!(
            normalize_book(&no_instrument_book, "x").unwrap_err(),
            NormalizeError::MissingField("instrument")
        );
    }

    #[test]
    fn object_levels_and_zero_sizes_preserved() {
        let raw = json!({
            "symbol": "BTC/USDT",
            "bids": [{"price": 100.0, "amount": 2.0}, {"price": 99.0, "qty": 0.0}],
            "asks": [{"price": 101.0, "size": 1.0}],
        });

        let out = normalize_book(&raw, "sim").unwrap();
        assert_eq!(out.bids, vec![[100.0, 2.0], [99.0, 0.0]]);
        assert_eq!(out.asks, vec![[101.0, 1.0]]);
        assert_eq!(out.sequence, None);
    }

    #[test]
    fn normalization_is_idempotent_on_canonical_payloads() {
        let raw = json!({
            "symbol": "BTC/USDT",
            "id": "t-1",
            "price": 35000.0,
            "amount": 0.25,
            "side": "sell",
            "timestamp": 1_609_459_200_000_i64,
        });

        let once = normalize_trade(&raw, "binance").unwrap();
        let round = serde_json::to_value(&once).unwrap();
        let twice = normalize_trade(&round, "binance").unwrap();

        assert_eq!(once.instrument, twice.instrument);
        assert_eq!(once.trade_id, twice.trade_id);
        assert_eq!(once.price, twice.price);
        assert_eq!(once.size, twice.size);
        assert_eq!(once.side, twice.side);
        assert_eq!(once.ts, twice.ts);
    }
}
