// =============================================================================
// Broker Tick Feed — WebSocket ingest and per-token actors
// =============================================================================
//
// One task reads the broker WebSocket and routes parsed ticks into per-token
// mailboxes. Each token's actor owns that token's gate and aggregator state,
// so the tick path is single-writer per token; cross-token work is parallel.
//
// The read loop runs until the stream disconnects or errors, then returns so
// the caller can handle reconnection with a delay.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::market_data::aggregator::{CandleStage, CandleStore, TokenAggregator, VolumeMode};
use crate::market_data::hub::{Envelope, StreamHub};
use crate::market_data::tick_gate::{GateMetrics, TickGate};
use crate::market_hours::MarketCalendar;
use crate::runtime_config::{GateConfig, HubConfig};
use crate::types::{MarketStatus, Tick, Timeframe};

/// Mailbox depth per token actor. Overflow falls back to awaiting, which
/// back-pressures the WS read loop for that token only briefly.
const MAILBOX_DEPTH: usize = 1024;

/// Everything a token actor needs besides its own state.
pub struct FeedShared {
    pub hub: Arc<StreamHub>,
    pub store: Arc<CandleStore>,
    pub gate_metrics: Arc<GateMetrics>,
    pub calendar: Arc<MarketCalendar>,
    pub gate_cfg: GateConfig,
    pub hub_cfg: HubConfig,
    pub volume_mode: VolumeMode,
    /// Closed-candle notifications for the re-analysis trigger.
    pub closed_tx: mpsc::Sender<(i64, Timeframe)>,
}

// =============================================================================
// WebSocket read loop
// =============================================================================

/// Connect to the broker tick stream and pump ticks into per-token actors
/// until the stream ends. The caller owns the reconnect loop.
pub async fn run_tick_feed(
    ws_url: &str,
    auth_token: &str,
    shared: Arc<FeedShared>,
    cancel: CancellationToken,
) -> Result<()> {
    let url = if auth_token.is_empty() {
        ws_url.to_string()
    } else {
        format!("{ws_url}?auth={auth_token}")
    };
    info!(url = %ws_url, "connecting to tick WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to tick WebSocket")?;

    info!("tick WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    let mut mailboxes: HashMap<i64, mpsc::Sender<Tick>> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tick feed cancelled — shutting down");
                return Ok(());
            }
            msg = read.next() => match msg {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_tick(&text) {
                            Ok(tick) => {
                                route_tick(tick, &mut mailboxes, &shared, &cancel).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to parse tick message");
                            }
                        }
                    }
                    // Ping/Pong/Binary/Close frames are handled by tungstenite.
                }
                Some(Err(e)) => {
                    error!(error = %e, "tick WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!("tick WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Deliver a tick to its token actor, spawning the actor on first sight.
async fn route_tick(
    tick: Tick,
    mailboxes: &mut HashMap<i64, mpsc::Sender<Tick>>,
    shared: &Arc<FeedShared>,
    cancel: &CancellationToken,
) {
    let token = tick.token;
    let tx = mailboxes.entry(token).or_insert_with(|| {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_token_actor(token, rx, shared, cancel).await;
        });
        info!(token, "token ingest actor spawned");
        tx
    });

    if tx.send(tick).await.is_err() {
        debug!(token, "token actor mailbox closed");
        mailboxes.remove(&token);
    }
}

/// Parse a broker tick message.
///
/// Expected shape:
/// ```json
/// { "token": 256265, "price": 22510.5, "volume_traded": 1204532,
///   "timestamp": 1700000000123, "bid": 22510.0, "ask": 22511.0 }
/// ```
pub fn parse_tick(text: &str) -> Result<Tick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse tick JSON")?;

    let token = root["token"].as_i64().context("missing field token")?;
    let price = root["price"].as_f64().context("missing field price")?;
    let volume_traded = root["volume_traded"]
        .as_f64()
        .context("missing field volume_traded")?;
    let timestamp = root["timestamp"]
        .as_i64()
        .context("missing field timestamp")?;

    Ok(Tick {
        token,
        price,
        volume_traded,
        timestamp,
        bid: root["bid"].as_f64(),
        ask: root["ask"].as_f64(),
    })
}

// =============================================================================
// Per-token actor
// =============================================================================

/// Serialises all ticks for one token through this task. Owns the token's
/// gate and aggregator state exclusively.
async fn run_token_actor(
    token: i64,
    mut rx: mpsc::Receiver<Tick>,
    shared: Arc<FeedShared>,
    cancel: CancellationToken,
) {
    let mut gate = TickGate::new(shared.gate_cfg.clone());
    let mut aggregator = TokenAggregator::new(token, shared.volume_mode, &Timeframe::ALL);
    let mut was_open = false;
    let mut last_error_broadcast_ms: i64 = 0;

    // Session-transition sweep: when the market leaves the open session the
    // remaining open buckets are flushed as closed candles.
    let mut session_check = tokio::time::interval(std::time::Duration::from_secs(30));
    session_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush_buckets(&mut aggregator, &shared).await;
                debug!(token, "token actor cancelled");
                return;
            }
            _ = session_check.tick() => {
                let status = shared.calendar.status_now();
                if was_open && !status.is_open() {
                    info!(token, status = %status, "session ended — flushing open buckets");
                    flush_buckets(&mut aggregator, &shared).await;
                }
                was_open = status.is_open();
            }
            tick = rx.recv() => {
                let Some(tick) = tick else {
                    flush_buckets(&mut aggregator, &shared).await;
                    debug!(token, "token actor mailbox drained — exiting");
                    return;
                };
                let now_ms = chrono::Utc::now().timestamp_millis();
                let status = shared.calendar.status_at(now_ms);
                was_open = status.is_open();

                handle_tick(
                    &tick,
                    status,
                    now_ms,
                    &mut gate,
                    &mut aggregator,
                    &shared,
                    &mut last_error_broadcast_ms,
                )
                .await;
            }
        }
    }
}

async fn handle_tick(
    tick: &Tick,
    status: MarketStatus,
    now_ms: i64,
    gate: &mut TickGate,
    aggregator: &mut TokenAggregator,
    shared: &Arc<FeedShared>,
    last_error_broadcast_ms: &mut i64,
) {
    match gate.admit(tick, status, now_ms) {
        Ok(()) => {
            shared.gate_metrics.record_admit();
            shared.hub.publish(&Envelope::tick(tick));

            for event in aggregator.fold(tick) {
                shared.store.apply(&event);
                shared
                    .hub
                    .publish(&Envelope::candle(&event.candle, event.stage, now_ms));

                if event.stage == CandleStage::Closed {
                    // Non-blocking: a saturated trigger channel loses the
                    // notification, not the candle.
                    let _ = shared
                        .closed_tx
                        .try_send((event.candle.token, event.candle.timeframe));
                }
            }
        }
        Err(reason) => {
            shared.gate_metrics.record_drop(reason, now_ms);

            if reason.is_malformed() {
                let window_ms = shared.hub_cfg.malformed_window_secs as i64 * 1_000;
                let count = shared.gate_metrics.malformed_in_window(now_ms, window_ms);
                // Broadcast at most once per window to avoid an error storm.
                if count > shared.hub_cfg.malformed_error_threshold
                    && now_ms - *last_error_broadcast_ms > window_ms
                {
                    *last_error_broadcast_ms = now_ms;
                    shared.hub.publish(&Envelope::backend_error(
                        "malformed tick rate exceeded threshold",
                        serde_json::json!({
                            "token": tick.token,
                            "reason": reason.as_str(),
                            "count_in_window": count,
                        }),
                        now_ms,
                    ));
                }
            }
        }
    }
}

async fn flush_buckets(aggregator: &mut TokenAggregator, shared: &Arc<FeedShared>) {
    let now_ms = chrono::Utc::now().timestamp_millis();
    for event in aggregator.close_all() {
        shared.store.apply(&event);
        shared
            .hub
            .publish(&Envelope::candle(&event.candle, event.stage, now_ms));
        let _ = shared
            .closed_tx
            .try_send((event.candle.token, event.candle.timeframe));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tick_ok() {
        let json = r#"{
            "token": 256265,
            "price": 22510.5,
            "volume_traded": 1204532,
            "timestamp": 1700000000123,
            "bid": 22510.0,
            "ask": 22511.0
        }"#;
        let tick = parse_tick(json).expect("should parse");
        assert_eq!(tick.token, 256265);
        assert!((tick.price - 22510.5).abs() < f64::EPSILON);
        assert_eq!(tick.timestamp, 1_700_000_000_123);
        assert_eq!(tick.bid, Some(22510.0));
    }

    #[test]
    fn parse_tick_optional_quotes() {
        let json = r#"{"token": 1, "price": 10.0, "volume_traded": 5, "timestamp": 1000}"#;
        let tick = parse_tick(json).unwrap();
        assert_eq!(tick.bid, None);
        assert_eq!(tick.ask, None);
    }

    #[test]
    fn parse_tick_missing_price_fails() {
        let json = r#"{"token": 1, "volume_traded": 5, "timestamp": 1000}"#;
        assert!(parse_tick(json).is_err());
    }
}
