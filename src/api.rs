//! HTTP and WebSocket surface.
//!
//! REST covers health, venue listing/status, manual ticker fetches, the hot
//! book read path and replay session creation. Two sockets: `/ws/feeds` for
//! live subscriptions and `/ws/replay/{id}` for historical streams.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::feed::FeedManager;
use crate::models::{Config, WsAction, WsClientMessage};
use crate::normalizer::coerce_timestamp;
use crate::publisher::Publisher;
use crate::replay::{stream_replay, ReplaySessions};
use crate::storage::{BookCache, Repo};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repo: Arc<Repo>,
    pub cache: Arc<BookCache>,
    pub publisher: Arc<Publisher>,
    pub manager: Arc<FeedManager>,
    pub sessions: Arc<ReplaySessions>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .route("/api/exchanges", get(list_exchanges))
        .route("/api/exchanges/status", get(exchanges_status))
        .route("/api/exchanges/:exchange/ticker/*symbol", get(fetch_ticker))
        .route("/api/book/*instrument", get(get_book))
        .route("/api/replay", post(create_replay))
        .route("/ws/feeds", get(ws_feeds))
        .route("/ws/replay/:session_id", get(ws_replay))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_body(error: &str, message: impl ToString) -> Json<Value> {
    Json(json!({"error": error, "message": message.to_string()}))
}

async fn root() -> Json<Value> {
    Json(json!({"name": "NexusFeed", "message": "Welcome to NexusFeed API"}))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "debug": state.config.debug,
        "sandbox": state.config.sandbox_mode,
    }))
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics_handle.render(),
    )
}

async fn list_exchanges(State(state): State<AppState>) -> Json<Value> {
    let exchanges: Vec<Value> = state
        .manager
        .venues()
        .iter()
        .map(|v| json!({"name": v.name(), "symbols": v.symbols()}))
        .collect();
    Json(json!({"exchanges": exchanges}))
}

async fn exchanges_status(State(state): State<AppState>) -> Json<Value> {
    let mut statuses = Vec::new();

    for venue in state.manager.venues() {
        let name = venue.name().to_string();
        let symbols = venue.symbols().to_vec();

        let probe = {
            let venue = venue.clone();
            tokio::task::spawn_blocking(move || venue.load_markets()).await
        };
        let (accessible, error) = match probe {
            Ok(Ok(_)) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(e) => (false, Some(e.to_string())),
        };

        statuses.push(json!({
            "name": name,
            "symbol_count": symbols.len(),
            "symbols": symbols,
            "accessible": accessible,
            "error": error,
        }));
    }

    let total = statuses.len();
    Json(json!({"exchanges": statuses, "total_exchanges": total}))
}

/// `BTCUSDT` -> `BTC/USDT` against common quote currencies; wire `-`
/// variants collapse to the canonical `/` form.
fn normalize_symbol(symbol: &str) -> String {
    let symbol = symbol.replace('-', "/");
    if symbol.contains('/') {
        return symbol;
    }
    for quote in ["USDT", "USD", "EUR", "GBP", "BTC", "ETH", "USDC"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{}/{}", base, quote);
            }
        }
    }
    symbol
}

async fn fetch_ticker(
    Path((exchange, symbol)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let Some(venue) = state.manager.venue(&exchange) else {
        let names: Vec<String> = state
            .manager
            .venues()
            .iter()
            .map(|v| v.name().to_string())
            .collect();
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Exchange '{}' not found", exchange),
                "message": format!("available exchanges: {}", names.join(", ")),
            })),
        )
            .into_response();
    };

    let normalized = normalize_symbol(&symbol);
    let matched = venue
        .symbols()
        .iter()
        .find(|s| {
            s.as_str() == normalized
                || s.as_str() == symbol
                || s.eq_ignore_ascii_case(&normalized)
        })
        .cloned();

    let Some(matched) = matched else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!(
                    "Symbol '{}' (normalized: '{}') not configured for {}",
                    symbol, normalized, exchange
                ),
                "message": format!("available symbols: {}", venue.symbols().join(", ")),
            })),
        )
            .into_response();
    };

    let fetched = {
        let venue = venue.clone();
        let matched = matched.clone();
        tokio::task::spawn_blocking(move || venue.fetch_ticker(&matched)).await
    };

    match fetched {
        Ok(Ok(ticker)) => {
            let price = ticker.get("last").cloned().unwrap_or(Value::Null);
            Json(json!({
                "exchange": venue.name(),
                "symbol": matched,
                "price": price,
                "ticker": ticker,
                "timestamp": chrono::Utc::now(),
            }))
            .into_response()
        }
        Ok(Err(e)) => (
            StatusCode::BAD_GATEWAY,
            error_body("venue fetch failed", e),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("fetch task failed", e),
        )
            .into_response(),
    }
}

/// Hot-cache read falling through to the repo.
async fn get_book(
    Path(instrument): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let instrument = instrument.replace('-', "/");

    if let Some(snap) = state.cache.get_snapshot(&instrument).await {
        return Json(snap).into_response();
    }

    match state.repo.latest_snapshot(&instrument) {
        Ok(Some(snap)) => Json(snap).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_body("book not found", format!("no snapshot for {}", instrument)),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("storage read failed", format!("{:#}", e)),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateReplayRequest {
    instrument: String,
    from_ts: Value,
    to_ts: Value,
    speed: Option<f64>,
}

async fn create_replay(
    State(state): State<AppState>,
    Json(req): Json<CreateReplayRequest>,
) -> Response {
    let instrument = req.instrument.replace('-', "/");
    let from_ts = coerce_timestamp(Some(&req.from_ts));
    let to_ts = coerce_timestamp(Some(&req.to_ts));

    match state
        .sessions
        .create(&instrument, from_ts, to_ts, req.speed)
    {
        Ok(session) => Json(json!({
            "session_id": session.id,
            "stream_url": format!("/ws/replay/{}", session.id),
        }))
        .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, error_body("invalid replay request", e)).into_response(),
    }
}

async fn ws_feeds(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_feed_socket(socket, state))
}

async fn handle_feed_socket(mut socket: WebSocket, state: AppState) {
    let (client_id, mut rx) = state.publisher.register();
    debug!(client = client_id, "feed client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let msg = event.to_string();
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    // Dispatcher evicted us (slow consumer) or shut down.
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsClientMessage>(&text) {
                            Ok(msg) => match msg.action {
                                WsAction::Subscribe => {
                                    state.publisher.subscribe(client_id, &msg.instrument);
                                }
                                WsAction::Unsubscribe => {
                                    state.publisher.unsubscribe(client_id, &msg.instrument);
                                }
                            },
                            Err(e) => {
                                let reply = json!({
                                    "error": "invalid message",
                                    "message": e.to_string(),
                                });
                                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = client_id, "feed socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    state.publisher.unregister(client_id);
    debug!(client = client_id, "feed client disconnected");
}

async fn ws_replay(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_replay_socket(socket, state, session_id))
}

async fn handle_replay_socket(mut socket: WebSocket, state: AppState, session_id: String) {
    let Some(session) = state.sessions.get(&session_id) else {
        let reply = json!({
            "error": "unknown replay session",
            "message": session_id,
        });
        let _ = socket.send(Message::Text(reply.to_string())).await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<Value>(64);
    let repo = state.repo.clone();
    let streamed = {
        let session = session.clone();
        tokio::spawn(async move { stream_replay(&repo, &session, &tx).await })
    };

    while let Some(event) = rx.recv().await {
        if socket.send(Message::Text(event.to_string())).await.is_err() {
            // Client disconnect terminates the stream.
            streamed.abort();
            break;
        }
    }

    if let Ok(Err(e)) = streamed.await {
        warn!(session = %session_id, "replay stream failed: {:#}", e);
    }

    // Session is one-shot: gone on completion, disconnect or failure alike.
    state.sessions.remove(&session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalization_variants() {
        assert_eq!(normalize_symbol("BTC/USDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("BTC-USDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("ETHBTC"), "ETH/BTC");
        assert_eq!(normalize_symbol("WEIRD"), "WEIRD");
    }
}
