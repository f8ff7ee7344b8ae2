// =============================================================================
// Orchestrator Entry — the end-to-end analysis request coordinator
// =============================================================================
//
// One request walks: source resolution -> candle fetch -> baseline
// indicators -> MTF pass -> remaining analyzers -> deterministic prior
// levels -> context -> synthesis -> persisted artifact.
//
// Degradation rules: step 1 failing is a hard DataUnavailable; every later
// step degrades into `meta.partial = true` instead of failing the request.
// A cancelled request (client disconnect or overall deadline) emits no
// decision. Ingress is bounded: excess concurrent requests are rejected
// with a retryable Busy error.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::agent::AnalysisInputs;
use crate::analysis::context::{ContextArgs, ContextBuilder};
use crate::analysis::decision::{AnalysisArtifact, Decision, DecisionRecord};
use crate::analysis::executor::run_analyzers;
use crate::analysis::levels::derive_prior_levels;
use crate::analysis::mtf::{verdict_from_results, MtfAggregator, MtfDeps, MtfSummary};
use crate::analysis::registry::{AnalyzerRegistry, MTF_ANALYZER_IDS};
use crate::analysis::synthesizer::{SynthesisArgs, Synthesizer};
use crate::analysis::agents::{insight, ml, patterns, sector, technical, volume};
use crate::cache::CandleCache;
use crate::error::EngineError;
use crate::indicators::compute_baseline;
use crate::llm::ModelTier;
use crate::market_data::aggregator::Candle;
use crate::market_hours::MarketCalendar;
use crate::persistence::DecisionStore;
use crate::provider::{CandleSource, InstrumentMap};
use crate::runtime_config::OrchestratorConfig;
use crate::types::{Bias, Timeframe};

// =============================================================================
// Request shapes
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    180_000
}

/// Recognised analysis options. Unknown keys are rejected at the boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisOptions {
    #[serde(default = "default_true")]
    pub include_mtf: bool,
    #[serde(default = "default_true")]
    pub include_sector: bool,
    #[serde(default = "default_true")]
    pub include_ml: bool,
    #[serde(default)]
    pub force_live: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub llm_model_tier: ModelTier,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            include_mtf: true,
            include_sector: true,
            include_ml: true,
            force_live: false,
            timeout_ms: default_timeout_ms(),
            llm_model_tier: ModelTier::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub exchange: String,
    pub period_days: u32,
    pub interval: Timeframe,
    pub options: AnalysisOptions,
}

/// What one successful request produces.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub decision: Decision,
    pub record: DecisionRecord,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    pub source: Arc<dyn CandleSource>,
    pub cache: Arc<CandleCache>,
    pub calendar: Arc<MarketCalendar>,
    pub registry: Arc<AnalyzerRegistry>,
    pub mtf: MtfAggregator,
    pub synthesizer: Synthesizer,
    pub store: Arc<dyn DecisionStore>,
    pub instruments: Arc<InstrumentMap>,
    pub cfg: OrchestratorConfig,
    pub context_budget_tokens: usize,
    pending: Semaphore,
    debounce: Mutex<HashMap<(String, Timeframe), Instant>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn CandleSource>,
        cache: Arc<CandleCache>,
        calendar: Arc<MarketCalendar>,
        registry: Arc<AnalyzerRegistry>,
        synthesizer: Synthesizer,
        store: Arc<dyn DecisionStore>,
        instruments: Arc<InstrumentMap>,
        cfg: OrchestratorConfig,
        context_budget_tokens: usize,
    ) -> Self {
        let pending = Semaphore::new(cfg.max_pending);
        Self {
            source,
            cache,
            calendar,
            registry,
            mtf: MtfAggregator::new(),
            synthesizer,
            store,
            instruments,
            cfg,
            context_budget_tokens,
            pending,
            debounce: Mutex::new(HashMap::new()),
        }
    }

    /// Run one analysis request end to end.
    pub async fn analyze(
        &self,
        req: AnalysisRequest,
        parent_cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome, EngineError> {
        validate_request(&req)?;

        let _permit = self
            .pending
            .try_acquire()
            .map_err(|_| EngineError::Busy)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = Duration::from_millis(req.options.timeout_ms);
        let cancel = parent_cancel.child_token();

        info!(
            request_id = %request_id,
            symbol = %req.symbol,
            interval = %req.interval,
            "analysis request accepted"
        );

        let result = tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                cancel.cancel();
                Err(EngineError::Timeout(req.options.timeout_ms))
            }
            _ = parent_cancel.cancelled() => {
                cancel.cancel();
                Err(EngineError::Cancelled)
            }
            r = self.pipeline(&req, &request_id, &cancel) => r,
        };

        match &result {
            Ok(outcome) => info!(
                request_id = %request_id,
                trend = %outcome.decision.trend,
                confidence = outcome.decision.confidence_pct,
                partial = outcome.decision.meta.partial,
                "analysis complete"
            ),
            Err(e) => warn!(request_id = %request_id, error = %e, "analysis failed"),
        }

        result
    }

    async fn pipeline(
        &self,
        req: &AnalysisRequest,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome, EngineError> {
        let started = Instant::now();
        let mut partial = false;
        let step_timeout = Duration::from_millis(self.cfg.step_timeout_ms);

        // ── Step 1: resolve source & fetch candles (hard failure) ───────
        let status = self.calendar.status_now();
        let plan = self.calendar.source_for(req.interval, status);
        let source_class = if req.options.force_live && status.is_open() {
            crate::market_hours::SourceClass::Live
        } else {
            plan.source
        };

        let (candles, cache_hit, fingerprint) = self
            .fetch_candles(req, plan.ttl_seconds, source_class, step_timeout, cancel)
            .await?;
        if candles.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "no candles for {} {}",
                req.symbol, req.interval
            )));
        }

        // ── Step 2: baseline indicators (pure) ───────────────────────────
        let indicators = Arc::new(compute_baseline(&candles));
        let current_price = indicators.current_price;
        let atr = match indicators.atr_14 {
            Some(atr) => atr,
            None => {
                // Too little history for a real ATR; degrade, do not fail.
                partial = true;
                current_price * 0.01
            }
        };
        let tick_size = self.instruments.tick_size(&req.symbol, &req.exchange);

        let data_quality = serde_json::json!({
            "candle_count": candles.len(),
            "source_class": source_class,
            "market_status": status,
            "cache_hit": cache_hit,
            "fingerprint": format!("{fingerprint:016x}"),
        });

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // ── Step 3: MTF pass ─────────────────────────────────────────────
        let mtf = if req.options.include_mtf {
            let deps = MtfDeps {
                source: self.source.clone(),
                cache: self.cache.clone(),
                calendar: self.calendar.clone(),
                registry: self.registry.clone(),
                analyzer_timeout_ms: self.cfg.analyzer_timeout_ms,
            };
            match tokio::time::timeout(
                step_timeout,
                self.mtf
                    .analyze(&deps, &req.symbol, &req.exchange, tick_size, cancel),
            )
            .await
            {
                Ok(summary) => summary,
                Err(_) => {
                    partial = true;
                    MtfSummary::unavailable("mtf step timed out")
                }
            }
        } else {
            MtfSummary::unavailable("disabled by options")
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // ── Step 4: remaining analyzers on the request interval ──────────
        let inputs = AnalysisInputs {
            symbol: req.symbol.clone(),
            exchange: req.exchange.clone(),
            timeframe: req.interval,
            current_price,
            candles: candles.clone(),
            indicators: indicators.clone(),
            tick_size,
            prior: Arc::new(HashMap::new()),
        };
        let ids = self.analyzer_ids(&req.options);
        let agent_results =
            run_analyzers(&self.registry, &ids, &inputs, cancel, self.cfg.analyzer_timeout_ms)
                .await;
        partial |= agent_results.values().any(|r| !r.is_ok());

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // ── Step 5: deterministic prior levels (never the LLM) ───────────
        let biases = horizon_biases(&agent_results, &mtf, req.interval);
        let prior = derive_prior_levels(current_price, atr, biases, tick_size);

        // ── Step 6: context + synthesis ──────────────────────────────────
        let context = ContextBuilder::new(self.context_budget_tokens).build(&ContextArgs {
            symbol: &req.symbol,
            current_price,
            tick_size,
            data_quality,
            agent_results: &agent_results,
            mtf: &mtf,
            prior_levels: &prior,
        });

        let decision = self
            .synthesizer
            .synthesize(
                &SynthesisArgs {
                    symbol: &req.symbol,
                    current_price,
                    context: &context,
                    prior: &prior,
                    mtf: &mtf,
                    tier: req.options.llm_model_tier,
                    partial,
                    request_id,
                },
                cancel,
            )
            .await;

        // A cancelled request emits no decision, even if synthesis raced
        // the deadline.
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // ── Step 7: persistable artifact ─────────────────────────────────
        let record = DecisionRecord::from_decision(
            &decision,
            &req.exchange,
            "full",
            current_price,
            serde_json::to_value(indicators.as_ref()).unwrap_or_default(),
            trading_strategy_line(&decision),
        );
        self.store.save(AnalysisArtifact {
            candles: candles.as_ref().clone(),
            agent_results: agent_results.clone(),
            record: record.clone(),
        });

        debug!(
            request_id = %request_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "artifact persisted"
        );

        Ok(AnalysisOutcome { decision, record })
    }

    async fn fetch_candles(
        &self,
        req: &AnalysisRequest,
        ttl_seconds: u64,
        source_class: crate::market_hours::SourceClass,
        step_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Vec<Candle>>, bool, u64), EngineError> {
        if let Some(entry) = self.cache.get(&req.symbol, req.interval) {
            return Ok((entry.candles, true, entry.fingerprint));
        }

        let fetch = self.source.candles(
            &req.symbol,
            &req.exchange,
            req.interval,
            req.period_days,
            cancel,
        );
        let fetched = match tokio::time::timeout(step_timeout, fetch).await {
            Ok(Ok(candles)) => candles,
            Ok(Err(e)) => {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                return Err(EngineError::DataUnavailable(e.to_string()));
            }
            Err(_) => return Err(EngineError::DataUnavailable("candle fetch timed out".into())),
        };

        let arc = Arc::new(fetched);
        let entry =
            self.cache
                .put(&req.symbol, req.interval, arc.clone(), ttl_seconds, source_class);
        Ok((arc, false, entry.fingerprint))
    }

    fn analyzer_ids(&self, options: &AnalysisOptions) -> Vec<&'static str> {
        let mut ids = vec![
            technical::TREND_ID,
            technical::MOMENTUM_ID,
            technical::VOLATILITY_ID,
            technical::TREND_STRENGTH_ID,
            technical::SUPPORT_RESISTANCE_ID,
            patterns::CHART_PATTERNS_ID,
            patterns::CANDLESTICK_ID,
            volume::VOLUME_REGIME_ID,
            insight::INSIGHT_ID,
        ];
        if options.include_sector {
            ids.push(sector::SECTOR_ID);
        }
        if options.include_ml {
            ids.push(ml::ML_ID);
        }
        ids.retain(|id| self.registry.contains(id));
        ids
    }

    // =========================================================================
    // On-rolling-bar re-analysis
    // =========================================================================

    /// Consume closed-candle notifications and re-run analysis for that
    /// (symbol, timeframe), debounced.
    pub async fn run_trigger_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(i64, Timeframe)>,
        cancel: CancellationToken,
    ) {
        info!("re-analysis trigger loop started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some((token, timeframe)) = event else { break };

            let Some(instrument) = self.instruments.by_token(token) else {
                debug!(token, "closed candle for unmapped token — ignoring");
                continue;
            };

            if !self.debounce_allows(&instrument.symbol, timeframe) {
                continue;
            }

            self.cache.invalidate(&instrument.symbol, timeframe);
            info!(symbol = %instrument.symbol, timeframe = %timeframe, "closed candle — re-analysis");

            let orchestrator = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let req = AnalysisRequest {
                    symbol: instrument.symbol.clone(),
                    exchange: instrument.exchange.clone(),
                    period_days: 30,
                    interval: timeframe,
                    options: AnalysisOptions::default(),
                };
                if let Err(e) = orchestrator.analyze(req, &cancel).await {
                    debug!(symbol = %instrument.symbol, error = %e, "re-analysis did not complete");
                }
            });
        }
        info!("re-analysis trigger loop stopped");
    }

    fn debounce_allows(&self, symbol: &str, timeframe: Timeframe) -> bool {
        let min_gap = Duration::from_secs(self.cfg.reanalysis_debounce_secs);
        let key = (symbol.to_string(), timeframe);
        let mut debounce = self.debounce.lock();
        let now = Instant::now();
        let allowed = debounce
            .get(&key)
            .map_or(true, |last| now.duration_since(*last) >= min_gap);
        if allowed {
            debounce.insert(key, now);
        }
        allowed
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_request(req: &AnalysisRequest) -> Result<(), EngineError> {
    if req.symbol.trim().is_empty() {
        return Err(EngineError::Client("symbol must not be empty".into()));
    }
    if !req
        .symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '&')
    {
        return Err(EngineError::Client(format!(
            "symbol contains invalid characters: {}",
            req.symbol
        )));
    }
    if req.period_days == 0 || req.period_days > 2_000 {
        return Err(EngineError::Client(format!(
            "period_days out of range: {}",
            req.period_days
        )));
    }
    if req.options.timeout_ms < 1_000 {
        return Err(EngineError::Client("timeout_ms must be at least 1000".into()));
    }
    Ok(())
}

/// Horizon biases from the indicator stage: the request-interval vote seeds
/// the short horizon; the hourly and daily MTF verdicts seed medium and
/// long, falling back to the short bias when unavailable.
fn horizon_biases(
    results: &HashMap<String, crate::analysis::agent::AgentResult>,
    mtf: &MtfSummary,
    interval: Timeframe,
) -> [Bias; 3] {
    let subset: HashMap<String, crate::analysis::agent::AgentResult> = results
        .iter()
        .filter(|(id, _)| MTF_ANALYZER_IDS.contains(&id.as_str()))
        .map(|(id, r)| (id.clone(), r.clone()))
        .collect();
    let short = verdict_from_results(interval, &subset).bias;

    let tf_bias = |tf: Timeframe| -> Option<Bias> {
        mtf.per_timeframe
            .iter()
            .find(|v| v.timeframe == tf && v.status == crate::analysis::agent::AgentStatus::Ok)
            .map(|v| v.bias)
    };

    let medium = tf_bias(Timeframe::H1).unwrap_or(short);
    let long = tf_bias(Timeframe::D1).unwrap_or(medium);
    [short, medium, long]
}

fn trading_strategy_line(decision: &Decision) -> String {
    match decision.trend {
        Bias::Bullish => format!(
            "accumulate within {:.2}-{:.2}, stop {:.2}",
            decision.short_term.entry_range[0],
            decision.short_term.entry_range[1],
            decision.short_term.stop_loss
        ),
        Bias::Bearish => format!(
            "sell strength within {:.2}-{:.2}, stop {:.2}",
            decision.short_term.entry_range[0],
            decision.short_term.entry_range[1],
            decision.short_term.stop_loss
        ),
        Bias::Neutral => "stand aside until alignment improves".to_string(),
    }
}
