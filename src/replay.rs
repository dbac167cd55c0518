//! Historical replay: time-ordered, rate-controlled event streams from
//! storage.
//!
//! A session pins `{instrument, window, speed}`; streaming merges the stored
//! trades and snapshots for the window and paces them by the gap between
//! consecutive timestamps divided by `speed` (2.0 compresses real time to
//! half, 0.5 stretches it to double).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::Repo;

#[derive(Debug, Clone)]
pub struct ReplaySession {
    pub id: String,
    pub instrument: String,
    pub from_ts: DateTime<Utc>,
    pub to_ts: DateTime<Utc>,
    pub speed: f64,
}

/// Process-local session registry.
#[derive(Default)]
pub struct ReplaySessions {
    inner: Mutex<HashMap<String, ReplaySession>>,
}

impl ReplaySessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a session. Missing speed means 1.0; zero or negative speed is
    /// rejected.
    pub fn create(
        &self,
        instrument: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
        speed: Option<f64>,
    ) -> Result<ReplaySession> {
        let speed = speed.unwrap_or(1.0);
        if !speed.is_finite() || speed <= 0.0 {
            return Err(anyhow!("replay speed must be positive, got {}", speed));
        }

        let session = ReplaySession {
            id: Uuid::new_v4().simple().to_string(),
            instrument: instrument.to_string(),
            from_ts,
            to_ts,
            speed,
        };
        self.inner
            .lock()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<ReplaySession> {
        self.inner.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Stream the session's window to `client`, paced by event spacing / speed.
///
/// A query failure emits one `{error}` event and ends the stream; a dead
/// client just ends it. The caller removes the session afterwards.
pub async fn stream_replay(
    repo: &Repo,
    session: &ReplaySession,
    client: &mpsc::Sender<Value>,
) -> Result<()> {
    let events = match collect_events(repo, session) {
        Ok(events) => events,
        Err(e) => {
            warn!(
                session = %session.id,
                instrument = %session.instrument,
                "replay query failed: {:#}",
                e
            );
            let _ = client
                .send(json!({
                    "error": "replay query failed",
                    "message": e.to_string(),
                }))
                .await;
            return Err(e);
        }
    };

    let mut prev: Option<DateTime<Utc>> = None;
    for (ts, event) in events {
        if let Some(prev) = prev {
            let gap = (ts - prev).to_std().unwrap_or_default();
            let wait = gap.div_f64(session.speed);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        if client.send(event).await.is_err() {
            debug!(session = %session.id, "replay client went away");
            return Ok(());
        }
        prev = Some(ts);
    }

    Ok(())
}

/// Merge trades and snapshots for the window, stably sorted by their
/// timestamp strings (all stored timestamps are fixed-width UTC, so string
/// order is instant order).
fn collect_events(
    repo: &Repo,
    session: &ReplaySession,
) -> Result<Vec<(DateTime<Utc>, Value)>> {
    let trades = repo.trades_in_window(&session.instrument, session.from_ts, session.to_ts)?;
    let snaps = repo.snapshots_in_window(&session.instrument, session.from_ts, session.to_ts)?;

    let mut events: Vec<(String, DateTime<Utc>, Value)> =
        Vec::with_capacity(trades.len() + snaps.len());

    for trade in trades {
        let mut event = serde_json::to_value(&trade)?;
        event["type"] = json!("trade");
        events.push((sort_key(trade.ts), trade.ts, event));
    }
    for snap in snaps {
        let mut event = serde_json::to_value(&snap)?;
        event["type"] = json!("book");
        events.push((sort_key(snap.ts), snap.ts, event));
    }

    events.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(events.into_iter().map(|(_, ts, event)| (ts, event)).collect())
}

fn sort_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookSnapshot, Trade};
    use chrono::TimeZone;
    use std::time::{Duration, Instant};

    fn trade_at(ts: DateTime<Utc>, id: &str) -> Trade {
        Trade {
            source: "sim".into(),
            instrument: "BTC/USDT".into(),
            trade_id: Some(id.into()),
            price: 35000.0,
            size: 0.01,
            side: Some("buy".into()),
            ts,
            received_at: ts,
        }
    }

    async fn seeded_repo(dir: &tempfile::TempDir) -> Repo {
        Repo::new(
            dir.path().join("replay.db").to_str().unwrap(),
            100,
            Duration::from_millis(50),
        )
        .unwrap()
    }

    #[test]
    fn speed_validation() {
        let sessions = ReplaySessions::new();
        let base = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();

        assert!(sessions
            .create("BTC/USDT", base, base, Some(0.0))
            .is_err());
        assert!(sessions
            .create("BTC/USDT", base, base, Some(-1.0))
            .is_err());

        let session = sessions.create("BTC/USDT", base, base, None).unwrap();
        assert_eq!(session.speed, 1.0);
        assert!(sessions.get(&session.id).is_some());

        sessions.remove(&session.id);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn replay_paces_by_speed() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded_repo(&dir).await;

        let t0 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        repo.insert_trade(trade_at(t0, "a")).unwrap();
        repo.insert_trade(trade_at(t0 + chrono::Duration::seconds(1), "b"))
            .unwrap();
        repo.shutdown().await.unwrap();

        let sessions = ReplaySessions::new();
        let session = sessions
            .create(
                "BTC/USDT",
                t0 - chrono::Duration::seconds(1),
                t0 + chrono::Duration::seconds(2),
                Some(2.0),
            )
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let started = Instant::now();
        stream_replay(&repo, &session, &tx).await.unwrap();
        let elapsed = started.elapsed();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first["trade_id"], "a");
        assert_eq!(second["trade_id"], "b");

        // 1s of history at 2x should take ~0.5s of real time.
        assert!(
            elapsed >= Duration::from_millis(450) && elapsed <= Duration::from_millis(700),
            "elapsed {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn replay_merges_trades_and_books_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded_repo(&dir).await;

        let t0 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        repo.insert_trade(trade_at(t0, "a")).unwrap();
        repo.upsert_snapshot(&BookSnapshot {
            source: "sim".into(),
            instrument: "BTC/USDT".into(),
            sequence: Some(7),
            bids: vec![[34999.0, 1.0]],
            asks: vec![[35001.0, 1.0]],
            ts: t0 + chrono::Duration::milliseconds(500),
        })
        .unwrap();
        repo.insert_trade(trade_at(t0 + chrono::Duration::seconds(1), "b"))
            .unwrap();
        repo.shutdown().await.unwrap();

        let sessions = ReplaySessions::new();
        let session = sessions
            .create(
                "BTC/USDT",
                t0,
                t0 + chrono::Duration::seconds(2),
                Some(1000.0),
            )
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        stream_replay(&repo, &session, &tx).await.unwrap();
        drop(tx);

        let mut types = Vec::new();
        while let Some(event) = rx.recv().await {
            types.push(event["type"].as_str().unwrap().to_string());
        }
        assert_eq!(types, vec!["trade", "book", "trade"]);
    }

    #[tokio::test]
    async fn dead_client_terminates_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded_repo(&dir).await;

        let t0 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        repo.insert_trade(trade_at(t0, "a")).unwrap();
        repo.shutdown().await.unwrap();

        let sessions = ReplaySessions::new();
        let session = sessions
            .create("BTC/USDT", t0, t0 + chrono::Duration::seconds(1), None)
            .unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(stream_replay(&repo, &session, &tx).await.is_ok());
    }
}
