//! Best-effort Redis cache of the latest book per instrument.
//!
//! Keys are `book:{instrument}`, values the canonical snapshot JSON. Every
//! failure is swallowed: the cache only shortcuts reads, and misses fall
//! through to the repo at the HTTP layer.

use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::models::BookSnapshot;

pub struct BookCache {
    client: Option<redis::Client>,
}

impl BookCache {
    /// Build a cache handle. Connections are established per operation, so a
    /// Redis that comes up later still gets used.
    pub fn connect(url: &str) -> Self {
        match redis::Client::open(url) {
            Ok(client) => Self {
                client: Some(client),
            },
            Err(e) => {
                warn!("invalid redis url, hot cache disabled: {}", e);
                Self { client: None }
            }
        }
    }

    /// A cache that never hits; used in tests and cacheless deployments.
    pub fn disabled() -> Self {
        Self { client: None }
    }

    fn key(instrument: &str) -> String {
        format!("book:{}", instrument)
    }

    pub async fn set_snapshot(&self, instrument: &str, snap: &BookSnapshot) {
        let Some(client) = &self.client else {
            return;
        };
        let payload = match serde_json::to_string(snap) {
            Ok(p) => p,
            Err(e) => {
                debug!("snapshot encode for cache failed: {}", e);
                return;
            }
        };

        match client.get_async_connection().await {
            Ok(mut con) => {
                if let Err(e) = con.set::<_, _, ()>(Self::key(instrument), payload).await {
                    debug!(instrument, "cache set failed: {}", e);
                }
            }
            Err(e) => debug!("cache connection failed: {}", e),
        }
    }

    pub async fn get_snapshot(&self, instrument: &str) -> Option<BookSnapshot> {
        let client = self.client.as_ref()?;
        let mut con = match client.get_async_connection().await {
            Ok(con) => con,
            Err(e) => {
                debug!("cache connection failed: {}", e);
                return None;
            }
        };

        let raw: Option<String> = match con.get(Self::key(instrument)).await {
            Ok(v) => v,
            Err(e) => {
                debug!(instrument, "cache get failed: {}", e);
                return None;
            }
        };

        raw.and_then(|data| match serde_json::from_str(&data) {
            Ok(snap) => Some(snap),
            Err(e) => {
                debug!(instrument, "cache held unparseable snapshot: {}", e);
                None
            }
        })
    }
}
