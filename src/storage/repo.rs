//! SQLite-backed persistence for trades and book snapshots.
//!
//! Two write paths:
//! - Trades are append-only and batched: `insert_trade` queues under a mutex,
//!   a background flusher commits every `flush_interval`, and hitting
//!   `batch_size` flushes inline on the caller. One transaction per batch.
//! - Snapshots upsert in place keyed by `(source, instrument)` so the
//!   freshest book per instrument is always queryable. Never batched: a
//!   batch under contention would invert the version order.
//!
//! A failed flush retains the batch for the next cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::{DB_WRITE_LATENCY_SECONDS, TRADES_INGESTED_TOTAL};
use crate::models::{BookSnapshot, Trade};

/// Tolerated venue-clock lead over the ingest clock before we log.
const SKEW_TOLERANCE_SECS: i64 = 5;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    instrument TEXT NOT NULL,
    trade_id TEXT,
    price REAL NOT NULL,
    size REAL NOT NULL,
    side TEXT,
    ts TEXT NOT NULL,
    received_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_source ON trades(source);
CREATE INDEX IF NOT EXISTS idx_trades_instrument ON trades(instrument);
CREATE INDEX IF NOT EXISTS idx_trades_trade_id ON trades(trade_id);
-- Replay scans are (instrument, ts range) ordered by ts.
CREATE INDEX IF NOT EXISTS idx_trades_instrument_ts ON trades(instrument, ts);

CREATE TABLE IF NOT EXISTS orderbook_snapshots (
    id INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    instrument TEXT NOT NULL,
    sequence INTEGER,
    bids TEXT NOT NULL,
    asks TEXT NOT NULL,
    ts TEXT NOT NULL,
    UNIQUE(source, instrument)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_instrument ON orderbook_snapshots(instrument);
"#;

/// Fixed-width RFC 3339 UTC so lexicographic order equals instant order.
fn ts_to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_db(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

struct RepoInner {
    conn: Mutex<Connection>,
    batch: Mutex<Vec<Trade>>,
    batch_size: usize,
    flush_interval: Duration,
}

/// Persistence repo with a background trade flusher.
pub struct Repo {
    inner: Arc<RepoInner>,
    shutdown_tx: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Repo {
    /// Open (or create) the database and start the flusher task.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(db_path: &str, batch_size: usize, flush_interval: Duration) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("database initialized at: {}", db_path);

        let inner = Arc::new(RepoInner {
            conn: Mutex::new(conn),
            batch: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            flush_interval,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = spawn_flusher(inner.clone(), shutdown_rx);

        Ok(Self {
            inner,
            shutdown_tx,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Enqueue a trade; flushes inline once the batch fills. Transient DB
    /// errors propagate to the caller, with the batch retained.
    pub fn insert_trade(&self, trade: Trade) -> Result<()> {
        if trade.received_at < trade.ts - chrono::Duration::seconds(SKEW_TOLERANCE_SECS) {
            warn!(
                source = %trade.source,
                instrument = %trade.instrument,
                venue_ts = %trade.ts,
                received_at = %trade.received_at,
                "trade timestamp ahead of ingest clock beyond skew tolerance"
            );
        }

        let drained = {
            let mut batch = self.inner.batch.lock();
            batch.push(trade);
            if batch.len() >= self.inner.batch_size {
                std::mem::take(&mut *batch)
            } else {
                return Ok(());
            }
        };

        if let Err(e) = self.inner.flush(&drained) {
            self.inner.requeue(drained);
            return Err(e);
        }
        Ok(())
    }

    /// Insert-or-update the snapshot row for `(source, instrument)`.
    pub fn upsert_snapshot(&self, snap: &BookSnapshot) -> Result<()> {
        let bids = serde_json::to_string(&snap.bids)?;
        let asks = serde_json::to_string(&snap.asks)?;

        let start = Instant::now();
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO orderbook_snapshots (source, instrument, sequence, bids, asks, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(source, instrument) DO UPDATE SET \
                sequence = excluded.sequence, \
                bids = excluded.bids, \
                asks = excluded.asks, \
                ts = excluded.ts",
        )?;
        stmt.execute(params![
            snap.source,
            snap.instrument,
            snap.sequence.map(|s| s as i64),
            bids,
            asks,
            ts_to_db(snap.ts),
        ])?;
        drop(stmt);
        drop(conn);

        metrics::histogram!(
            DB_WRITE_LATENCY_SECONDS,
            start.elapsed().as_secs_f64(),
            "operation" => "snapshot_upsert"
        );
        Ok(())
    }

    /// Trades for `instrument` with `ts` in `[from, to]`, ordered by `ts`.
    pub fn trades_in_window(
        &self,
        instrument: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, instrument, trade_id, price, size, side, ts, received_at \
             FROM trades \
             WHERE instrument = ?1 AND ts >= ?2 AND ts <= ?3 \
             ORDER BY ts, id",
        )?;

        let trades = stmt
            .query_map(
                params![instrument, ts_to_db(from), ts_to_db(to)],
                row_to_trade,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }

    /// Snapshot rows for `instrument` with `ts` in `[from, to]`, ordered by `ts`.
    pub fn snapshots_in_window(
        &self,
        instrument: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BookSnapshot>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, instrument, sequence, bids, asks, ts \
             FROM orderbook_snapshots \
             WHERE instrument = ?1 AND ts >= ?2 AND ts <= ?3 \
             ORDER BY ts, id",
        )?;

        let snaps = stmt
            .query_map(
                params![instrument, ts_to_db(from), ts_to_db(to)],
                row_to_snapshot,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(snaps)
    }

    /// Freshest persisted snapshot for an instrument across sources.
    pub fn latest_snapshot(&self, instrument: &str) -> Result<Option<BookSnapshot>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, instrument, sequence, bids, asks, ts \
             FROM orderbook_snapshots \
             WHERE instrument = ?1 \
             ORDER BY ts DESC \
             LIMIT 1",
        )?;

        let mut rows = stmt.query([instrument])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    pub fn trade_count(&self) -> Result<i64> {
        let conn = self.inner.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Stop the flusher and commit any residual batch.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained = self.inner.drain();
        if !drained.is_empty() {
            if let Err(e) = self.inner.flush(&drained) {
                self.inner.requeue(drained);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl RepoInner {
    fn drain(&self) -> Vec<Trade> {
        std::mem::take(&mut *self.batch.lock())
    }

    fn requeue(&self, mut drained: Vec<Trade>) {
        let mut batch = self.batch.lock();
        drained.extend(batch.drain(..));
        *batch = drained;
    }

    /// Commit one batch in a single transaction.
    fn flush(&self, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trades \
                 (source, instrument, trade_id, price, size, side, ts, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for t in trades {
                stmt.execute(params![
                    t.source,
                    t.instrument,
                    t.trade_id,
                    t.price,
                    t.size,
                    t.side,
                    ts_to_db(t.ts),
                    ts_to_db(t.received_at),
                ])?;
            }
        }
        tx.commit()?;
        drop(conn);

        metrics::histogram!(
            DB_WRITE_LATENCY_SECONDS,
            start.elapsed().as_secs_f64(),
            "operation" => "trade_flush"
        );
        metrics::counter!(TRADES_INGESTED_TOTAL, trades.len() as u64);
        debug!("flushed {} trades", trades.len());
        Ok(())
    }
}

fn spawn_flusher(inner: Arc<RepoInner>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(inner.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let drained = inner.drain();
                    if drained.is_empty() {
                        continue;
                    }
                    if let Err(e) = inner.flush(&drained) {
                        warn!("trade flush failed, retaining batch: {:#}", e);
                        inner.requeue(drained);
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let ts: String = row.get(6)?;
    let received_at: String = row.get(7)?;
    Ok(Trade {
        source: row.get(0)?,
        instrument: row.get(1)?,
        trade_id: row.get(2)?,
        price: row.get(3)?,
        size: row.get(4)?,
        side: row.get(5)?,
        ts: ts_from_db(&ts)?,
        received_at: ts_from_db(&received_at)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<BookSnapshot> {
    let sequence: Option<i64> = row.get(2)?;
    let bids: String = row.get(3)?;
    let asks: String = row.get(4)?;
    let ts: String = row.get(5)?;

    Ok(BookSnapshot {
        source: row.get(0)?,
        instrument: row.get(1)?,
        sequence: sequence.map(|s| s as u64),
        bids: serde_json::from_str(&bids)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        asks: serde_json::from_str(&asks)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        ts: ts_from_db(&ts)?,
    })
}
