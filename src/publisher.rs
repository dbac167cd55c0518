//! In-process event broker fanning canonical events out to subscribers.
//!
//! One bounded event queue fed by the ingest paths, one dispatcher task
//! draining it. Subscriptions are tracked both ways (instrument -> clients
//! and client -> instruments) under a single lock. Per-client channels are
//! bounded; a client that is closed or too slow to drain its buffer is
//! unregistered on the spot so it cannot stall the rest.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub type ClientId = u64;

/// Events buffered per client before it counts as a slow consumer.
const CLIENT_BUFFER: usize = 256;

#[derive(Default)]
struct SubState {
    clients: HashMap<ClientId, mpsc::Sender<Value>>,
    subs: HashMap<String, HashSet<ClientId>>,
    client_subs: HashMap<ClientId, HashSet<String>>,
}

struct Inner {
    state: Mutex<SubState>,
    next_id: AtomicU64,
}

pub struct Publisher {
    inner: Arc<Inner>,
    event_tx: mpsc::Sender<Value>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Wire variants use `-`; the canonical instrument key uses `/`.
fn normalize_instrument(instrument: &str) -> String {
    instrument.replace('-', "/")
}

impl Publisher {
    /// Start the broker with the given event-queue capacity.
    pub fn spawn(queue_capacity: usize) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(queue_capacity.max(1));
        let inner = Arc::new(Inner {
            state: Mutex::new(SubState::default()),
            next_id: AtomicU64::new(1),
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), event_rx));

        Arc::new(Self {
            inner,
            event_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Add a client; the returned receiver yields every event for the
    /// instruments it subscribes to.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<Value>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);

        let mut state = self.inner.state.lock();
        state.clients.insert(id, tx);
        state.client_subs.insert(id, HashSet::new());
        (id, rx)
    }

    /// Remove a client and tear down all of its subscriptions.
    pub fn unregister(&self, id: ClientId) {
        unregister_client(&self.inner, id);
    }

    pub fn subscribe(&self, id: ClientId, instrument: &str) {
        let instrument = normalize_instrument(instrument);
        let mut state = self.inner.state.lock();
        if !state.clients.contains_key(&id) {
            debug!(client = id, "subscribe from unknown client ignored");
            return;
        }
        state
            .subs
            .entry(instrument.clone())
            .or_default()
            .insert(id);
        state
            .client_subs
            .entry(id)
            .or_default()
            .insert(instrument);
    }

    pub fn unsubscribe(&self, id: ClientId, instrument: &str) {
        let instrument = normalize_instrument(instrument);
        let mut state = self.inner.state.lock();
        if let Some(set) = state.subs.get_mut(&instrument) {
            set.remove(&id);
            if set.is_empty() {
                state.subs.remove(&instrument);
            }
        }
        if let Some(set) = state.client_subs.get_mut(&id) {
            set.remove(&instrument);
        }
    }

    /// Enqueue an event. Non-blocking while the queue has room; once full,
    /// producers are back-pressured on an awaited send.
    pub async fn publish(&self, event: Value) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                trace!("publisher queue full, blocking producer");
                if self.event_tx.send(event).await.is_err() {
                    warn!("publisher stopped, event dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("publisher stopped, event dropped");
            }
        }
    }

    /// Cancel the dispatcher; events still queued are discarded.
    pub fn stop(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    /// Subscriber count for an instrument (canonical form), 0 when absent.
    pub fn subscriber_count(&self, instrument: &str) -> usize {
        let instrument = normalize_instrument(instrument);
        self.inner
            .state
            .lock()
            .subs
            .get(&instrument)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.len()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut event_rx: mpsc::Receiver<Value>) {
    while let Some(event) = event_rx.recv().await {
        let Some(instrument) = event.get("instrument").and_then(Value::as_str) else {
            continue;
        };

        // Snapshot the target set so unregister can run concurrently.
        let targets: Vec<(ClientId, mpsc::Sender<Value>)> = {
            let state = inner.state.lock();
            match state.subs.get(instrument) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| state.clients.get(id).map(|tx| (*id, tx.clone())))
                    .collect(),
                None => continue,
            }
        };

        for (id, tx) in targets {
            if tx.try_send(event.clone()).is_err() {
                // Closed or saturated: evict so one client never stalls the bus.
                debug!(client = id, instrument, "dropping slow or closed subscriber");
                unregister_client(&inner, id);
            }
        }
    }
}

fn unregister_client(inner: &Inner, id: ClientId) {
    let mut state = inner.state.lock();
    state.clients.remove(&id);
    if let Some(instruments) = state.client_subs.remove(&id) {
        for instrument in instruments {
            if let Some(set) = state.subs.get_mut(&instrument) {
                set.remove(&id);
                if set.is_empty() {
                    state.subs.remove(&instrument);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_one(rx: &mut mpsc::Receiver<Value>) -> Value {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn fanout_reaches_only_subscribers() {
        let publisher = Publisher::spawn(1000);
        let (a, mut rx_a) = publisher.register();
        let (b, mut rx_b) = publisher.register();

        // Wire variant with `-` must land on the canonical key.
        publisher.subscribe(a, "BTC-USDT");
        publisher.subscribe(b, "ETH/USDT");

        publisher
            .publish(json!({"instrument": "BTC/USDT", "price": 35000.0}))
            .await;

        let got = recv_one(&mut rx_a).await;
        assert_eq!(got["instrument"], "BTC/USDT");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_b.try_recv().is_err());

        publisher.unregister(a);
        assert_eq!(publisher.subscriber_count("BTC/USDT"), 0);

        publisher
            .publish(json!({"instrument": "BTC/USDT", "price": 35001.0}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());

        publisher.stop();
    }

    #[tokio::test]
    async fn per_instrument_fifo_from_single_producer() {
        let publisher = Publisher::spawn(1000);
        let (id, mut rx) = publisher.register();
        publisher.subscribe(id, "BTC/USDT");

        for i in 0..20 {
            publisher
                .publish(json!({"instrument": "BTC/USDT", "seq": i}))
                .await;
        }

        for i in 0..20 {
            let got = recv_one(&mut rx).await;
            assert_eq!(got["seq"], i);
        }

        publisher.stop();
    }

    #[tokio::test]
    async fn closed_client_is_evicted_on_send() {
        let publisher = Publisher::spawn(1000);
        let (id, rx) = publisher.register();
        publisher.subscribe(id, "BTC/USDT");
        drop(rx);

        publisher
            .publish(json!({"instrument": "BTC/USDT", "price": 1.0}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(publisher.client_count(), 0);
        assert_eq!(publisher.subscriber_count("BTC/USDT"), 0);

        publisher.stop();
    }

    #[tokio::test]
    async fn unsubscribe_updates_both_indices() {
        let publisher = Publisher::spawn(1000);
        let (id, mut rx) = publisher.register();
        publisher.subscribe(id, "BTC/USDT");
        publisher.unsubscribe(id, "BTC-USDT");

        publisher
            .publish(json!({"instrument": "BTC/USDT", "price": 1.0}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        publisher.stop();
    }
}
