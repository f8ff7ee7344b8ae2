// =============================================================================
// Engine Configuration — Hot-loadable settings with atomic save
// =============================================================================
//
// Every tunable of the analysis engine lives here. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Secrets (provider keys, LLM keys) come from the environment,
// never from this file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::aggregator::VolumeMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_watch_tokens() -> Vec<i64> {
    vec![256265, 260105, 738561, 2953217]
}

fn default_provider_base_url() -> String {
    "https://api.argus-data.example.com".to_string()
}

fn default_feed_ws_url() -> String {
    "wss://feed.argus-data.example.com/stream".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_dup_window_ms() -> i64 {
    30_000
}

fn default_max_clock_skew_ms() -> i64 {
    3_600_000
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_ws_write_timeout_ms() -> u64 {
    2_000
}

fn default_malformed_threshold() -> u64 {
    50
}

fn default_malformed_window_secs() -> u64 {
    60
}

fn default_utc_offset_minutes() -> i32 {
    330 // IST
}

fn default_pre_open_minute() -> u32 {
    9 * 60
}

fn default_open_minute() -> u32 {
    9 * 60 + 15
}

fn default_close_minute() -> u32 {
    15 * 60 + 30
}

fn default_post_close_minute() -> u32 {
    16 * 60
}

fn default_primary_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_fallback_model() -> String {
    "google/gemini-2.5-flash".to_string()
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_primary_budget_tokens() -> usize {
    160_000
}

fn default_fallback_budget_tokens() -> usize {
    100_000
}

fn default_headroom_tokens() -> usize {
    8_000
}

fn default_attempt_timeout_ms() -> u64 {
    45_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_output_tokens() -> u32 {
    4_000
}

fn default_max_pending() -> usize {
    8
}

fn default_total_timeout_ms() -> u64 {
    180_000
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_analyzer_timeout_ms() -> u64 {
    20_000
}

fn default_debounce_secs() -> u64 {
    300
}

fn default_sector_benchmark() -> String {
    "NIFTY50".to_string()
}

fn default_max_closed_candles() -> usize {
    1_000
}

// =============================================================================
// Sections
// =============================================================================

/// Broker tick feed settings. `volume_mode` is a declaration, not a guess:
/// the aggregator refuses to infer volume semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_ws_url")]
    pub ws_url: String,

    /// Instrument tokens streamed at startup.
    #[serde(default = "default_watch_tokens")]
    pub watch_tokens: Vec<i64>,

    /// How the feed reports volume on ticks.
    #[serde(default)]
    pub volume_mode: VolumeMode,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_feed_ws_url(),
            watch_tokens: default_watch_tokens(),
            volume_mode: VolumeMode::default(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// Tick gate tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Duplicate window while the market is not OPEN (milliseconds).
    #[serde(default = "default_dup_window_ms")]
    pub closed_dup_window_ms: i64,

    /// A tick whose timestamp deviates from the wall clock by more than this
    /// is rejected as clock skew.
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            closed_dup_window_ms: default_dup_window_ms(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
        }
    }
}

/// Fan-out hub tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber envelope buffer. Overflow drops tick envelopes first;
    /// closed candles and errors are never dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Outbound WebSocket write timeout; exceeding it engages the drop
    /// policy instead of stalling the pump.
    #[serde(default = "default_ws_write_timeout_ms")]
    pub ws_write_timeout_ms: u64,

    /// Malformed-tick count within the rolling window that triggers a
    /// `backend_error` envelope to subscribers.
    #[serde(default = "default_malformed_threshold")]
    pub malformed_error_threshold: u64,

    #[serde(default = "default_malformed_window_secs")]
    pub malformed_window_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            ws_write_timeout_ms: default_ws_write_timeout_ms(),
            malformed_error_threshold: default_malformed_threshold(),
            malformed_window_secs: default_malformed_window_secs(),
        }
    }
}

/// Exchange session calendar. Defaults describe an NSE-style session; every
/// bound is configurable so the engine is not exchange-bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Exchange local-time offset from UTC, in minutes.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    /// Session bounds as minutes past local midnight.
    #[serde(default = "default_pre_open_minute")]
    pub pre_open_minute: u32,
    #[serde(default = "default_open_minute")]
    pub open_minute: u32,
    #[serde(default = "default_close_minute")]
    pub close_minute: u32,
    #[serde(default = "default_post_close_minute")]
    pub post_close_minute: u32,

    /// Exchange holidays as `YYYY-MM-DD` in exchange local time.
    #[serde(default)]
    pub holidays: Vec<String>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            pre_open_minute: default_pre_open_minute(),
            open_minute: default_open_minute(),
            close_minute: default_close_minute(),
            post_close_minute: default_post_close_minute(),
            holidays: Vec::new(),
        }
    }
}

/// Language-model routing and budgeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_primary_model")]
    pub primary_model: String,

    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,

    /// Input budgets per tier, in approximate tokens.
    #[serde(default = "default_primary_budget_tokens")]
    pub primary_input_budget: usize,
    #[serde(default = "default_fallback_budget_tokens")]
    pub fallback_input_budget: usize,

    /// Reserved slack below the budget when composing a prompt.
    #[serde(default = "default_headroom_tokens")]
    pub headroom_tokens: usize,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Attempts per tier on transient failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            primary_model: default_primary_model(),
            fallback_model: default_fallback_model(),
            primary_input_budget: default_primary_budget_tokens(),
            fallback_input_budget: default_fallback_budget_tokens(),
            headroom_tokens: default_headroom_tokens(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempts: default_max_attempts(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Orchestrator limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Bound on concurrently pending analysis requests; excess requests are
    /// rejected with a retryable error.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,

    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    #[serde(default = "default_analyzer_timeout_ms")]
    pub analyzer_timeout_ms: u64,

    /// Minimum spacing between closed-candle re-analysis runs for one
    /// (symbol, timeframe).
    #[serde(default = "default_debounce_secs")]
    pub reanalysis_debounce_secs: u64,

    /// Benchmark symbol for the sector analyzer.
    #[serde(default = "default_sector_benchmark")]
    pub sector_benchmark: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            total_timeout_ms: default_total_timeout_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            analyzer_timeout_ms: default_analyzer_timeout_ms(),
            reanalysis_debounce_secs: default_debounce_secs(),
            sector_benchmark: default_sector_benchmark(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Argus engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub calendar: CalendarConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Closed candles retained per (token, timeframe).
    #[serde(default = "default_max_closed_candles")]
    pub max_closed_candles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_base_url: default_provider_base_url(),
            feed: FeedConfig::default(),
            gate: GateConfig::default(),
            hub: HubConfig::default(),
            calendar: CalendarConfig::default(),
            llm: LlmConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            max_closed_candles: default_max_closed_candles(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Missing file is an error so the caller can fall back to defaults with
    /// a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            tokens = config.feed.watch_tokens.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (tmp, then
    /// rename) so a crash mid-write cannot corrupt the file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.gate.closed_dup_window_ms, 30_000);
        assert_eq!(cfg.hub.subscriber_buffer, 256);
        assert_eq!(cfg.orchestrator.total_timeout_ms, 180_000);
        assert_eq!(cfg.orchestrator.analyzer_timeout_ms, 20_000);
        assert_eq!(cfg.llm.attempt_timeout_ms, 45_000);
        assert_eq!(cfg.llm.max_attempts, 3);
        assert_eq!(cfg.calendar.open_minute, 9 * 60 + 15);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.hub.ws_write_timeout_ms, 2_000);
        assert_eq!(cfg.orchestrator.max_pending, 8);
        assert!(!cfg.feed.watch_tokens.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "feed": { "watch_tokens": [42] }, "hub": { "subscriber_buffer": 16 } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.feed.watch_tokens, vec![42]);
        assert_eq!(cfg.hub.subscriber_buffer, 16);
        assert_eq!(cfg.hub.ws_write_timeout_ms, 2_000);
        assert_eq!(cfg.gate.closed_dup_window_ms, 30_000);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.feed.watch_tokens, cfg2.feed.watch_tokens);
        assert_eq!(cfg.llm.primary_model, cfg2.llm.primary_model);
        assert_eq!(
            cfg.orchestrator.reanalysis_debounce_secs,
            cfg2.orchestrator.reanalysis_debounce_secs
        );
    }
}
