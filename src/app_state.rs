// =============================================================================
// Central Application State — Argus Analysis Engine
// =============================================================================
//
// The composition root. All subsystems manage their own interior mutability
// (parking_lot locks, atomics); AppState ties them together behind one
// `Arc` shared by the API layer, the feed tasks, and the orchestrator.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use crate::analysis::orchestrator::Orchestrator;
use crate::analysis::registry::AnalyzerRegistry;
use crate::analysis::synthesizer::Synthesizer;
use crate::cache::CandleCache;
use crate::llm::{LlmClient, OpenRouterTransport};
use crate::market_data::aggregator::CandleStore;
use crate::market_data::hub::StreamHub;
use crate::market_data::tick_gate::GateMetrics;
use crate::market_hours::MarketCalendar;
use crate::persistence::{DecisionStore, InMemoryDecisionStore};
use crate::provider::{InstrumentMap, MarketDataClient};
use crate::runtime_config::EngineConfig;

/// Decisions retained by the in-memory store.
const MAX_STORED_DECISIONS: usize = 200;

/// Shared state for the whole engine.
pub struct AppState {
    pub config: RwLock<EngineConfig>,
    pub calendar: Arc<MarketCalendar>,
    pub cache: Arc<CandleCache>,
    pub candle_store: Arc<CandleStore>,
    pub hub: Arc<StreamHub>,
    pub gate_metrics: Arc<GateMetrics>,
    pub instruments: Arc<InstrumentMap>,
    pub provider: Arc<MarketDataClient>,
    pub orchestrator: Arc<Orchestrator>,
    pub decision_store: Arc<dyn DecisionStore>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every subsystem together from the configuration plus the
    /// secrets in the environment.
    pub fn build(config: EngineConfig) -> Result<Arc<Self>> {
        let calendar = Arc::new(MarketCalendar::new(&config.calendar));
        let cache = Arc::new(CandleCache::new());
        let candle_store = Arc::new(CandleStore::new(config.max_closed_candles));
        let hub = Arc::new(StreamHub::new(config.hub.subscriber_buffer));
        let gate_metrics = Arc::new(GateMetrics::new());
        let instruments = Arc::new(InstrumentMap::new());

        let provider = Arc::new(MarketDataClient::new(
            std::env::var("ARGUS_API_KEY").unwrap_or_default(),
            std::env::var("ARGUS_API_SECRET").unwrap_or_default(),
            config.provider_base_url.clone(),
        ));

        let http = reqwest::Client::builder()
            .build()
            .context("failed to build LLM http client")?;
        // A missing key is not fatal: every LLM failure mode already
        // degrades to the deterministic fallback decision.
        let transport = match OpenRouterTransport::from_env(http.clone(), config.llm.base_url.clone())
        {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::warn!(error = %e, "LLM credentials unavailable — synthesis will use deterministic fallbacks");
                Arc::new(OpenRouterTransport::new(
                    http,
                    String::new(),
                    config.llm.base_url.clone(),
                ))
            }
        };
        let llm = Arc::new(LlmClient::new(transport, config.llm.clone()));

        let registry = Arc::new(AnalyzerRegistry::standard(
            llm.clone(),
            provider.clone(),
            config.orchestrator.sector_benchmark.clone(),
        ));

        let decision_store: Arc<dyn DecisionStore> =
            Arc::new(InMemoryDecisionStore::new(MAX_STORED_DECISIONS));

        let context_budget = config
            .llm
            .fallback_input_budget
            .min(config.llm.primary_input_budget)
            .saturating_sub(config.llm.headroom_tokens * 2);

        let orchestrator = Arc::new(Orchestrator::new(
            provider.clone(),
            cache.clone(),
            calendar.clone(),
            registry,
            Synthesizer::new(llm),
            decision_store.clone(),
            instruments.clone(),
            config.orchestrator.clone(),
            context_budget,
        ));

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            calendar,
            cache,
            candle_store,
            hub,
            gate_metrics,
            instruments,
            provider,
            orchestrator,
            decision_store,
            start_time: Instant::now(),
        }))
    }
}
