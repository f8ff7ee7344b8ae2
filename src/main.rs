// =============================================================================
// Argus Analysis Engine — Main Entry Point
// =============================================================================
//
// Startup order: config, shared state, broker feed (per-token ingest
// actors), instrument refresh loop, re-analysis trigger loop, HTTP/WS
// server, then wait for Ctrl+C and cancel everything through the root
// token.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysis;
mod api;
mod app_state;
mod cache;
mod error;
mod indicators;
mod llm;
mod market_data;
mod market_hours;
mod persistence;
mod provider;
mod runtime_config;
mod types;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::feed::{self, FeedShared};
use crate::runtime_config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Argus analysis engine starting up");

    let config_path =
        std::env::var("ARGUS_CONFIG").unwrap_or_else(|_| "engine_config.json".into());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::build(config)?;
    let root_cancel = CancellationToken::new();

    // ── 3. Instrument map: initial load + slow refresh ───────────────────
    {
        let provider = state.provider.clone();
        let instruments = state.instruments.clone();
        let cancel = root_cancel.clone();
        tokio::spawn(async move {
            loop {
                match provider.fetch_instruments(&cancel).await {
                    Ok(list) if !list.is_empty() => instruments.replace(list),
                    Ok(_) => warn!("instrument master fetch returned nothing"),
                    Err(e) => warn!(error = %e, "instrument master fetch failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(6 * 3600)) => {}
                }
            }
        });
    }

    // ── 4. Re-analysis trigger channel ───────────────────────────────────
    let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(1024);
    {
        let orchestrator = state.orchestrator.clone();
        let cancel = root_cancel.clone();
        tokio::spawn(async move {
            orchestrator.run_trigger_loop(closed_rx, cancel).await;
        });
    }

    // ── 5. Broker tick feed with reconnect loop ──────────────────────────
    {
        let (feed_cfg, gate_cfg, hub_cfg, volume_mode, reconnect_delay) = {
            let cfg = state.config.read();
            (
                cfg.feed.clone(),
                cfg.gate.clone(),
                cfg.hub.clone(),
                cfg.feed.volume_mode,
                cfg.feed.reconnect_delay_secs,
            )
        };
        let shared = Arc::new(FeedShared {
            hub: state.hub.clone(),
            store: state.candle_store.clone(),
            gate_metrics: state.gate_metrics.clone(),
            calendar: state.calendar.clone(),
            gate_cfg,
            hub_cfg,
            volume_mode,
            closed_tx,
        });
        let provider = state.provider.clone();
        let cancel = root_cancel.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let auth_token = match provider.ws_auth_token(&cancel).await {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(error = %e, "ws auth token fetch failed — retrying");
                        String::new()
                    }
                };
                if let Err(e) =
                    feed::run_tick_feed(&feed_cfg.ws_url, &auth_token, shared.clone(), cancel.clone())
                        .await
                {
                    error!(error = %e, "tick feed error — reconnecting");
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(reconnect_delay)) => {}
                }
            }
        });
    }

    // ── 6. HTTP/WS server ────────────────────────────────────────────────
    let bind_addr = std::env::var("ARGUS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8400".into());
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;
    info!(addr = %bind_addr, "API server listening");

    let server_cancel = root_cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    root_cancel.cancel();

    if let Err(e) = state.config.read().save(&config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server).await;
    info!("Argus shut down complete");
    Ok(())
}
