//! Incremental depth books for venues that stream sequenced deltas.
//!
//! Binance-style discipline: seed from a REST snapshot carrying
//! `lastUpdateId`, then apply deltas keyed by `(U, u)` =
//! [firstUpdateId, lastUpdateId]. Any gap or out-of-order delta discards the
//! local ladder and re-fetches the snapshot. Resyncs are idempotent and may
//! run as often as needed.

use std::collections::{BTreeMap, HashMap};

use float_ord::FloatOrd;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::VenueError;
use crate::metrics::CONNECTOR_RESTARTS_TOTAL;
use crate::normalizer::parse_levels;

/// Full book snapshot as returned by a venue's depth REST endpoint.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// One incremental depth update.
#[derive(Debug, Clone, Default)]
pub struct DepthDelta {
    pub first_update_id: Option<u64>,
    pub last_update_id: Option<u64>,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

impl DepthDelta {
    /// Parse the Binance depth-stream wire shape `{U, u, b, a}`.
    pub fn from_raw(raw: &Value) -> Result<Self, VenueError> {
        let bids = parse_levels(raw.get("b").or_else(|| raw.get("bids")))
            .map_err(|e| VenueError::Exchange(e.to_string()))?;
        let asks = parse_levels(raw.get("a").or_else(|| raw.get("asks")))
            .map_err(|e| VenueError::Exchange(e.to_string()))?;
        Ok(Self {
            first_update_id: raw.get("U").and_then(Value::as_u64),
            last_update_id: raw.get("u").and_then(Value::as_u64),
            bids,
            asks,
        })
    }
}

/// Sorted copy of a maintained book: bids descending, asks ascending.
#[derive(Debug, Clone)]
pub struct DepthBookView {
    pub sequence: Option<u64>,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// Blocking snapshot source, supplied by the owning venue adapter.
pub type SnapshotFetcher = Box<dyn Fn(&str) -> Result<DepthSnapshot, VenueError> + Send + Sync>;

// Price keys hold the exact parsed representation; venues send canonical
// decimal strings, so bit-equality is the right level identity.
type Ladder = BTreeMap<FloatOrd<f64>, f64>;

#[derive(Default)]
struct SymbolBook {
    last_update_id: Option<u64>,
    bids: Ladder,
    asks: Ladder,
}

impl SymbolBook {
    fn reset_from(&mut self, snap: &DepthSnapshot) {
        self.last_update_id = Some(snap.last_update_id);
        self.bids = snap.bids.iter().map(|l| (FloatOrd(l[0]), l[1])).collect();
        self.asks = snap.asks.iter().map(|l| (FloatOrd(l[0]), l[1])).collect();
    }

    fn apply_levels(ladder: &mut Ladder, levels: &[[f64; 2]]) {
        for level in levels {
            let (price, size) = (level[0], level[1]);
            if size == 0.0 {
                ladder.remove(&FloatOrd(price));
            } else {
                ladder.insert(FloatOrd(price), size);
            }
        }
    }

    fn is_crossed(&self) -> bool {
        match (self.bids.keys().next_back(), self.asks.keys().next()) {
            (Some(bid), Some(ask)) => bid.0 >= ask.0,
            _ => false,
        }
    }
}

/// Per-venue set of incremental books with sequence discipline.
pub struct DepthBookEngine {
    connector: String,
    fetcher: SnapshotFetcher,
    state: Mutex<HashMap<String, SymbolBook>>,
}

impl DepthBookEngine {
    pub fn new(connector: impl Into<String>, fetcher: SnapshotFetcher) -> Self {
        Self {
            connector: connector.into(),
            fetcher,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    /// Apply one delta. Returns whether it was applied; `false` covers both
    /// harmless drops (stale delta after a fresh snapshot) and gap-triggered
    /// resyncs.
    pub fn apply_delta(&self, symbol: &str, delta: &DepthDelta) -> Result<bool, VenueError> {
        let mut state = self.state.lock();
        let book = state.entry(symbol.to_string()).or_default();

        if book.last_update_id.is_none() {
            self.resync_locked(symbol, book)?;
            // Deltas at or before the snapshot are already folded in.
            if let (Some(u), Some(last)) = (delta.last_update_id, book.last_update_id) {
                if u <= last {
                    return Ok(false);
                }
            }
        }

        let last = book.last_update_id.unwrap_or(0);

        let (Some(first), Some(final_id)) = (delta.first_update_id, delta.last_update_id) else {
            warn!(
                connector = %self.connector,
                symbol,
                "depth delta missing sequence bounds, resyncing"
            );
            self.resync_locked(symbol, book)?;
            return Ok(false);
        };

        // Contiguous, or an envelope covering last+1 (the first delta after a
        // snapshot typically straddles it).
        if first == last + 1 || (first <= last + 1 && last + 1 <= final_id) {
            SymbolBook::apply_levels(&mut book.bids, &delta.bids);
            SymbolBook::apply_levels(&mut book.asks, &delta.asks);
            book.last_update_id = Some(final_id);

            if book.is_crossed() {
                warn!(
                    connector = %self.connector,
                    symbol,
                    sequence = final_id,
                    "crossed book after delta, resyncing"
                );
                self.resync_locked(symbol, book)?;
                return Ok(false);
            }
            return Ok(true);
        }

        warn!(
            connector = %self.connector,
            symbol,
            last,
            first_update_id = first,
            last_update_id = final_id,
            "depth sequence gap, resyncing"
        );
        self.resync_locked(symbol, book)?;
        Ok(false)
    }

    /// Discard local state for `symbol` and re-seed from a fresh snapshot.
    pub fn resync(&self, symbol: &str) -> Result<(), VenueError> {
        let mut state = self.state.lock();
        let book = state.entry(symbol.to_string()).or_default();
        self.resync_locked(symbol, book)
    }

    fn resync_locked(&self, symbol: &str, book: &mut SymbolBook) -> Result<(), VenueError> {
        let snap = (self.fetcher)(symbol)?;
        book.reset_from(&snap);
        metrics::counter!(
            CONNECTOR_RESTARTS_TOTAL, 1,
            "connector" => self.connector.clone()
        );
        info!(
            connector = %self.connector,
            symbol,
            sequence = snap.last_update_id,
            "depth book resynced"
        );
        Ok(())
    }

    /// Sorted copy of the maintained book, or `None` before the first sync.
    pub fn get_book(&self, symbol: &str) -> Option<DepthBookView> {
        let state = self.state.lock();
        let book = state.get(symbol)?;
        book.last_update_id?;

        let bids = book
            .bids
            .iter()
            .rev()
            .map(|(p, q)| [p.0, *q])
            .collect::<Vec<_>>();
        let asks = book.asks.iter().map(|(p, q)| [p.0, *q]).collect::<Vec<_>>();

        Some(DepthBookView {
            sequence: book.last_update_id,
            bids,
            asks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn engine_with_counter(last_update_id: u64) -> (DepthBookEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let fetcher: SnapshotFetcher = Box::new(move |_symbol| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(DepthSnapshot {
                last_update_id,
                bids: vec![[35000.0, 1.0]],
                asks: vec![[35010.0, 1.0]],
            })
        });
        (DepthBookEngine::new("binance", fetcher), calls)
    }

    fn delta(first: u64, last: u64, bids: Vec<[f64; 2]>, asks: Vec<[f64; 2]>) -> DepthDelta {
        DepthDelta {
            first_update_id: Some(first),
            last_update_id: Some(last),
            bids,
            asks,
        }
    }

    #[test]
    fn resync_on_gap() {
        let (engine, calls) = engine_with_counter(100);

        // Arrives before any snapshot: engine fetches one, delta is stale.
        let applied = engine
            .apply_delta("BTC/USDT", &delta(90, 95, vec![[34999.0, 0.5]], vec![]))
            .unwrap();
        assert!(!applied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Contiguous with the snapshot: applied.
        let applied = engine
            .apply_delta("BTC/USDT", &delta(101, 101, vec![[35001.0, 0.3]], vec![]))
            .unwrap();
        assert!(applied);
        let book = engine.get_book("BTC/USDT").unwrap();
        assert_eq!(book.sequence, Some(101));

        // Far ahead of last+1: gap, second snapshot fetch.
        let applied = engine
            .apply_delta("BTC/USDT", &delta(200, 200, vec![[35002.0, 0.2]], vec![]))
            .unwrap();
        assert!(!applied);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gapless_sequence_merges_into_snapshot() {
        let (engine, calls) = engine_with_counter(10);
        engine.resync("BTC/USDT").unwrap();

        let deltas = [
            delta(11, 12, vec![[34990.0, 2.0]], vec![[35010.0, 0.0]]),
            delta(13, 13, vec![[35000.0, 0.0]], vec![[35020.0, 1.5]]),
            delta(14, 16, vec![[34995.0, 4.0]], vec![]),
        ];
        for d in &deltas {
            assert!(engine.apply_delta("BTC/USDT", d).unwrap());
        }

        let book = engine.get_book("BTC/USDT").unwrap();
        assert_eq!(book.sequence, Some(16));
        // 35000 deleted, 34995 inserted above 34990.
        assert_eq!(book.bids, vec![[34995.0, 4.0], [34990.0, 2.0]]);
        // 35010 deleted, 35020 remains.
        assert_eq!(book.asks, vec![[35020.0, 1.5]]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_sequence_bounds_resync() {
        let (engine, calls) = engine_with_counter(100);
        engine.resync("BTC/USDT").unwrap();

        let unbounded = DepthDelta {
            first_update_id: None,
            last_update_id: None,
            bids: vec![[34999.0, 1.0]],
            asks: vec![],
        };
        assert!(!engine.apply_delta("BTC/USDT", &unbounded).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn crossed_result_forces_resync() {
        let (engine, calls) = engine_with_counter(100);
        engine.resync("BTC/USDT").unwrap();

        // Bid through the ask: invalid, engine must re-seed.
        let crossing = delta(101, 101, vec![[35011.0, 1.0]], vec![]);
        assert!(!engine.apply_delta("BTC/USDT", &crossing).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let book = engine.get_book("BTC/USDT").unwrap();
        assert_eq!(book.sequence, Some(100));
        assert_eq!(book.bids, vec![[35000.0, 1.0]]);
    }

    #[test]
    fn delta_from_binance_wire_shape() {
        let raw = serde_json::json!({
            "U": 157, "u": 160,
            "b": [["0.0024", "10"]],
            "a": [["0.0026", "100"]],
        });
        let d = DepthDelta::from_raw(&raw).unwrap();
        assert_eq!(d.first_update_id, Some(157));
        assert_eq!(d.last_update_id, Some(160));
        assert_eq!(d.bids, vec![[0.0024, 10.0]]);
        assert_eq!(d.asks, vec![[0.0026, 100.0]]);
    }
}
