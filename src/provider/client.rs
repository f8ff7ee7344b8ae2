// =============================================================================
// Market Data REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// Adapter for the broker's data API: historical candles, the instrument
// master, and the WebSocket auth token. SECURITY: the secret key is never
// logged or serialised; signed requests carry the API key as a header and
// the signature as a query parameter.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::market_data::aggregator::Candle;
use crate::provider::instruments::Instrument;
use crate::types::Timeframe;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// CandleSource seam
// =============================================================================

/// Anything that can produce a historical candle dataset. The orchestrator
/// and MTF aggregator depend on this seam, not on the HTTP client, so tests
/// drive the pipeline with fixtures.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn candles(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: Timeframe,
        period_days: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>>;
}

// =============================================================================
// Client
// =============================================================================

/// REST client for the market-data provider.
#[derive(Clone)]
pub struct MarketDataClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl MarketDataClient {
    /// # Arguments
    /// * `api_key` — provider API key (sent as a header, never in the query).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-ARGUS-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "MarketDataClient initialised");

        Self {
            secret,
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Query string for a signed request (appends timestamp and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(
        &self,
        path: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(query));

        let send = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {path} request failed"))?;

            let status = resp.status();
            let body: serde_json::Value = resp
                .json()
                .await
                .with_context(|| format!("failed to parse {path} response"))?;

            if !status.is_success() {
                anyhow::bail!("provider {path} returned {status}: {body}");
            }
            Ok(body)
        };

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("request cancelled"),
            result = send => result,
        }
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// GET /v1/instruments — the full instrument master.
    #[instrument(skip(self, cancel), name = "provider::fetch_instruments")]
    pub async fn fetch_instruments(&self, cancel: &CancellationToken) -> Result<Vec<Instrument>> {
        let body = self.get_json("/v1/instruments", "", cancel).await?;

        let rows = body["instruments"]
            .as_array()
            .context("instruments response missing 'instruments' array")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_instrument(row) {
                Ok(inst) => out.push(inst),
                Err(e) => warn!(error = %e, "skipping malformed instrument row"),
            }
        }

        debug!(count = out.len(), "instrument master fetched");
        Ok(out)
    }

    /// GET /v1/ws-token — a short-lived token for the tick WebSocket.
    #[instrument(skip(self, cancel), name = "provider::ws_auth_token")]
    pub async fn ws_auth_token(&self, cancel: &CancellationToken) -> Result<String> {
        let body = self.get_json("/v1/ws-token", "", cancel).await?;
        body["token"]
            .as_str()
            .map(str::to_string)
            .context("ws-token response missing 'token'")
    }
}

#[async_trait]
impl CandleSource for MarketDataClient {
    /// GET /v1/candles — historical candles, oldest first. Rows that fail
    /// the candle invariants are dropped with a warning; an entirely empty
    /// result is the caller's DataUnavailable case.
    async fn candles(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: Timeframe,
        period_days: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>> {
        let query = format!(
            "symbol={symbol}&exchange={exchange}&interval={}&days={period_days}",
            timeframe.as_str()
        );
        let body = self.get_json("/v1/candles", &query, cancel).await?;

        let token = body["token"].as_i64().unwrap_or(0);
        let rows = body["candles"]
            .as_array()
            .context("candles response missing 'candles' array")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_candle_row(row, token, timeframe) {
                Ok(candle) if candle.is_well_formed() => out.push(candle),
                Ok(candle) => {
                    warn!(symbol, start = candle.start, "dropping malformed candle row");
                }
                Err(e) => warn!(symbol, error = %e, "failed to parse candle row"),
            }
        }

        debug!(symbol, interval = %timeframe, count = out.len(), "candles fetched");
        Ok(out)
    }
}

/// Parse one `[start, open, high, low, close, volume]` row.
fn parse_candle_row(row: &serde_json::Value, token: i64, timeframe: Timeframe) -> Result<Candle> {
    let arr = row.as_array().context("candle row is not an array")?;
    if arr.len() < 6 {
        anyhow::bail!("candle row has {} fields, expected 6", arr.len());
    }

    let start = arr[0].as_i64().context("candle start not an integer")?;
    let get = |i: usize, name: &str| -> Result<f64> {
        arr[i]
            .as_f64()
            .with_context(|| format!("candle {name} not a number"))
    };

    Ok(Candle {
        token,
        timeframe,
        start,
        end: start + timeframe.duration_ms(),
        open: get(1, "open")?,
        high: get(2, "high")?,
        low: get(3, "low")?,
        close: get(4, "close")?,
        volume: get(5, "volume")?,
    })
}

fn parse_instrument(row: &serde_json::Value) -> Result<Instrument> {
    Ok(Instrument {
        token: row["token"].as_i64().context("instrument missing token")?,
        symbol: row["symbol"]
            .as_str()
            .context("instrument missing symbol")?
            .to_string(),
        exchange: row["exchange"]
            .as_str()
            .context("instrument missing exchange")?
            .to_string(),
        name: row["name"].as_str().unwrap_or_default().to_string(),
        tick_size: row["tick_size"].as_f64(),
    })
}
