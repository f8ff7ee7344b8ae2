// =============================================================================
// WebSocket Streaming Handler — /ws/stream
// =============================================================================
//
// After connecting, the client sends a subscription message:
//
//   { "action": "subscribe", "tokens": [<int>...], "timeframes": ["1m", ...] }
//
// Further subscription messages replace the filter atomically. The server
// pushes tick / candle / backend_error envelopes per the hub's wire
// contract. An outbound write slower than the configured timeout engages
// the drop policy: droppable envelopes are discarded and counted, an
// undroppable one ends the connection.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::hub::{Envelope, SubscriptionFilter};
use crate::types::Timeframe;

// =============================================================================
// Subscription protocol
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubscribeMessage {
    action: String,
    #[serde(default)]
    tokens: Vec<i64>,
    #[serde(default)]
    timeframes: Vec<String>,
}

fn parse_subscription(text: &str) -> Result<SubscriptionFilter, String> {
    let msg: SubscribeMessage =
        serde_json::from_str(text).map_err(|e| format!("malformed subscription: {e}"))?;
    if msg.action != "subscribe" {
        return Err(format!("unsupported action: {}", msg.action));
    }

    let mut timeframes: Vec<Timeframe> = Vec::with_capacity(msg.timeframes.len());
    for tf in &msg.timeframes {
        timeframes.push(tf.parse().map_err(|e: String| e)?);
    }

    Ok(SubscriptionFilter::for_subscription(&msg.tokens, &timeframes))
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("stream WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_stream_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Pump envelopes from this connection's hub subscription while processing
/// inbound subscription updates, via `tokio::select!`.
async fn handle_stream_connection(socket: WebSocket, state: Arc<AppState>) {
    let subscriber = state.hub.subscribe();
    let write_timeout = Duration::from_millis(state.config.read().hub.ws_write_timeout_ms);
    let (mut sender, mut receiver) = socket.split();

    info!(subscriber = subscriber.id(), "stream subscriber connected");

    loop {
        tokio::select! {
            // ── Outbound: hub envelopes ─────────────────────────────────
            envelope = subscriber.recv() => {
                let Some(envelope) = envelope else { break };
                let droppable = matches!(
                    &envelope,
                    Envelope::Tick { .. }
                        | Envelope::Candle { stage: crate::market_data::aggregator::CandleStage::Rolling, .. }
                );

                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        // Serialisation failure is not a network error;
                        // skip the envelope rather than disconnect.
                        warn!(error = %e, "failed to serialise envelope");
                        continue;
                    }
                };

                match tokio::time::timeout(write_timeout, sender.send(Message::Text(json))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "stream send failed — disconnecting");
                        break;
                    }
                    Err(_elapsed) if droppable => {
                        debug!(subscriber = subscriber.id(), "slow write — envelope dropped");
                    }
                    Err(_elapsed) => {
                        warn!(subscriber = subscriber.id(), "slow write on undroppable envelope — disconnecting");
                        break;
                    }
                }
            }

            // ── Inbound: subscription updates & control frames ──────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_subscription(&text) {
                            Ok(filter) => {
                                debug!(
                                    subscriber = subscriber.id(),
                                    tokens = filter.tokens.len(),
                                    series = filter.series.len(),
                                    "subscription replaced"
                                );
                                subscriber.update_filter(filter);
                            }
                            Err(reason) => {
                                // Malformed envelopes never kill the stream;
                                // report back on the error channel.
                                let err = Envelope::backend_error(
                                    reason,
                                    serde_json::json!({"received": text.chars().take(200).collect::<String>()}),
                                    chrono::Utc::now().timestamp_millis(),
                                );
                                if let Ok(json) = serde_json::to_string(&err) {
                                    let _ = sender.send(Message::Text(json)).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber = subscriber.id(), "close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "stream receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(
        subscriber = subscriber.id(),
        dropped_ticks = subscriber.dropped_ticks(),
        "stream subscriber disconnected"
    );
    // Dropping the subscriber detaches it from the hub.
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_subscription() {
        let filter = parse_subscription(
            r#"{"action": "subscribe", "tokens": [256265, 260105], "timeframes": ["1m", "5m"]}"#,
        )
        .unwrap();
        assert_eq!(filter.tokens.len(), 2);
        assert_eq!(filter.series.len(), 4);
        assert!(filter.series.contains(&(256265, Timeframe::M1)));
        assert!(filter.series.contains(&(260105, Timeframe::M5)));
    }

    #[test]
    fn parse_rejects_bad_action() {
        assert!(parse_subscription(r#"{"action": "noop", "tokens": []}"#).is_err());
    }

    #[test]
    fn parse_rejects_bad_timeframe() {
        let result = parse_subscription(
            r#"{"action": "subscribe", "tokens": [1], "timeframes": ["7m"]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_rejects_malformed_json() {
        assert!(parse_subscription("{not json").is_err());
    }

    #[test]
    fn empty_subscription_is_valid() {
        let filter =
            parse_subscription(r#"{"action": "subscribe", "tokens": [], "timeframes": []}"#)
                .unwrap();
        assert!(filter.tokens.is_empty());
        assert!(filter.series.is_empty());
    }
}
