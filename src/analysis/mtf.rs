// =============================================================================
// Multi-Timeframe Aggregator — the analyzer core across six timeframes
// =============================================================================
//
// Runs the indicator/pattern/volume analyzer subset on each canonical
// timeframe, derives a per-timeframe bias + confidence, and scores
// cross-timeframe alignment:
//
//   alignment = (bullish_tfs - bearish_tfs) / used_tfs      in [-1, 1]
//
// Timeframes that did not produce an ok verdict are excluded from the
// denominator; they appear in `conflicting_timeframes` only when their last
// known bias disagrees with the current majority.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analysis::agent::{AgentResult, AgentStatus, AnalysisInputs};
use crate::analysis::executor::run_analyzers;
use crate::analysis::registry::{AnalyzerRegistry, MTF_ANALYZER_IDS};
use crate::cache::CandleCache;
use crate::indicators::compute_baseline;
use crate::market_hours::MarketCalendar;
use crate::provider::CandleSource;
use crate::types::{Bias, Timeframe};

/// The canonical MTF timeframe set, shortest first.
pub const MTF_TIMEFRAMES: [Timeframe; 6] = [
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::D1,
];

/// History depth fetched per timeframe, in days.
fn period_days_for(tf: Timeframe) -> u32 {
    match tf {
        Timeframe::M1 => 5,
        Timeframe::M5 => 30,
        Timeframe::M15 => 60,
        Timeframe::M30 => 90,
        Timeframe::H1 => 180,
        Timeframe::D1 => 365,
    }
}

// =============================================================================
// Output types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TimeframeVerdict {
    pub timeframe: Timeframe,
    pub status: AgentStatus,
    pub bias: Bias,
    pub confidence: f64,
    /// Per-agent summaries; the context builder drops this under budget
    /// pressure.
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MtfSummary {
    pub per_timeframe: Vec<TimeframeVerdict>,
    pub alignment: f64,
    pub dominant_bias: Bias,
    pub confidence_boost: f64,
    pub conflicting_timeframes: Vec<Timeframe>,
    pub used_timeframes: usize,
}

impl MtfSummary {
    /// Placeholder when the MTF pass was disabled or timed out.
    pub fn unavailable(reason: &str) -> Self {
        Self {
            per_timeframe: Vec::new(),
            alignment: 0.0,
            dominant_bias: Bias::Neutral,
            confidence_boost: 0.0,
            conflicting_timeframes: Vec::new(),
            used_timeframes: 0,
        }
        .tap_reason(reason)
    }

    fn tap_reason(self, reason: &str) -> Self {
        debug!(reason, "mtf summary unavailable");
        self
    }
}

// =============================================================================
// Dependencies
// =============================================================================

pub struct MtfDeps {
    pub source: Arc<dyn CandleSource>,
    pub cache: Arc<CandleCache>,
    pub calendar: Arc<MarketCalendar>,
    pub registry: Arc<AnalyzerRegistry>,
    pub analyzer_timeout_ms: u64,
}

// =============================================================================
// Aggregator
// =============================================================================

/// Holds the last known bias per (symbol, timeframe) so excluded timeframes
/// can be flagged as conflicting.
pub struct MtfAggregator {
    memory: RwLock<HashMap<(String, Timeframe), Bias>>,
}

impl MtfAggregator {
    pub fn new() -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
        }
    }

    /// Run the MTF pass for one symbol. Individual timeframe failures
    /// degrade that timeframe, never the pass.
    pub async fn analyze(
        &self,
        deps: &MtfDeps,
        symbol: &str,
        exchange: &str,
        tick_size: Option<f64>,
        cancel: &CancellationToken,
    ) -> MtfSummary {
        let mut join_set: JoinSet<TimeframeVerdict> = JoinSet::new();

        for tf in MTF_TIMEFRAMES {
            let source = deps.source.clone();
            let cache = deps.cache.clone();
            let calendar = deps.calendar.clone();
            let registry = deps.registry.clone();
            let timeout_ms = deps.analyzer_timeout_ms;
            let symbol = symbol.to_string();
            let exchange = exchange.to_string();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                analyze_timeframe(
                    source, cache, calendar, registry, timeout_ms, &symbol, &exchange, tf,
                    tick_size, &cancel,
                )
                .await
            });
        }

        let mut verdicts: Vec<TimeframeVerdict> = Vec::with_capacity(MTF_TIMEFRAMES.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(verdict) => verdicts.push(verdict),
                Err(e) => warn!(error = %e, "mtf timeframe task panicked"),
            }
        }
        verdicts.sort_by_key(|v| v.timeframe);

        self.summarise(symbol, verdicts)
    }

    /// Test-only entry into the summarisation step.
    #[cfg(test)]
    pub fn test_summarise(&self, symbol: &str, verdicts: Vec<TimeframeVerdict>) -> MtfSummary {
        self.summarise(symbol, verdicts)
    }

    fn summarise(&self, symbol: &str, verdicts: Vec<TimeframeVerdict>) -> MtfSummary {
        let ok: Vec<&TimeframeVerdict> = verdicts
            .iter()
            .filter(|v| v.status == AgentStatus::Ok)
            .collect();
        let used = ok.len();

        let bullish = ok.iter().filter(|v| v.bias == Bias::Bullish).count() as f64;
        let bearish = ok.iter().filter(|v| v.bias == Bias::Bearish).count() as f64;
        let alignment = if used > 0 {
            (bullish - bearish) / used as f64
        } else {
            0.0
        };

        let dominant_bias = if bullish > bearish {
            Bias::Bullish
        } else if bearish > bullish {
            Bias::Bearish
        } else {
            Bias::Neutral
        };

        // Remember fresh biases; flag excluded timeframes whose remembered
        // bias disagrees with the current majority.
        let mut conflicting: Vec<Timeframe> = Vec::new();
        {
            let mut memory = self.memory.write();
            for v in &verdicts {
                let key = (symbol.to_string(), v.timeframe);
                if v.status == AgentStatus::Ok {
                    memory.insert(key, v.bias);
                } else if let Some(&remembered) = memory.get(&key) {
                    if dominant_bias != Bias::Neutral
                        && remembered != Bias::Neutral
                        && remembered != dominant_bias
                    {
                        conflicting.push(v.timeframe);
                    }
                }
            }
        }

        let confidence_boost = (alignment.abs() * 20.0).round();

        MtfSummary {
            per_timeframe: verdicts,
            alignment,
            dominant_bias,
            confidence_boost,
            conflicting_timeframes: conflicting,
            used_timeframes: used,
        }
    }
}

impl Default for MtfAggregator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Per-timeframe analysis
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn analyze_timeframe(
    source: Arc<dyn CandleSource>,
    cache: Arc<CandleCache>,
    calendar: Arc<MarketCalendar>,
    registry: Arc<AnalyzerRegistry>,
    analyzer_timeout_ms: u64,
    symbol: &str,
    exchange: &str,
    tf: Timeframe,
    tick_size: Option<f64>,
    cancel: &CancellationToken,
) -> TimeframeVerdict {
    let failed = |reason: String| TimeframeVerdict {
        timeframe: tf,
        status: AgentStatus::Failed,
        bias: Bias::Neutral,
        confidence: 0.0,
        detail: serde_json::json!({ "status": "unavailable", "reason": reason }),
    };

    // Fetch through the cache under the policy TTL.
    let candles = match cache.get(symbol, tf) {
        Some(entry) => entry.candles,
        None => {
            let status = calendar.status_now();
            let plan = calendar.source_for(tf, status);
            match source
                .candles(symbol, exchange, tf, period_days_for(tf), cancel)
                .await
            {
                Ok(fetched) if !fetched.is_empty() => {
                    let arc = Arc::new(fetched);
                    cache.put(symbol, tf, arc.clone(), plan.ttl_seconds, plan.source);
                    arc
                }
                Ok(_) => return failed("no candles returned".to_string()),
                Err(e) => return failed(e.to_string()),
            }
        }
    };

    let indicators = Arc::new(compute_baseline(&candles));
    let inputs = AnalysisInputs {
        symbol: symbol.to_string(),
        exchange: exchange.to_string(),
        timeframe: tf,
        current_price: indicators.current_price,
        candles,
        indicators,
        tick_size,
        prior: Arc::new(HashMap::new()),
    };

    let results = run_analyzers(
        registry.as_ref(),
        &MTF_ANALYZER_IDS,
        &inputs,
        cancel,
        analyzer_timeout_ms,
    )
    .await;

    verdict_from_results(tf, &results)
}

/// Confidence-weighted bias vote over the subset's results.
pub fn verdict_from_results(
    tf: Timeframe,
    results: &HashMap<String, AgentResult>,
) -> TimeframeVerdict {
    let mut bull_score = 0.0;
    let mut bear_score = 0.0;
    let mut ok_count = 0usize;
    let mut detail = serde_json::Map::new();

    for (id, result) in results {
        let entry = match result.status {
            AgentStatus::Ok => {
                ok_count += 1;
                let conf = result.confidence.unwrap_or(0.0);
                match result.payload_bias() {
                    Some(Bias::Bullish) => bull_score += conf,
                    Some(Bias::Bearish) => bear_score += conf,
                    _ => {}
                }
                serde_json::json!({
                    "status": "ok",
                    "bias": result.payload_bias().map(|b| b.to_string()),
                    "confidence": result.confidence,
                })
            }
            _ => serde_json::json!({
                "status": "unavailable",
                "reason": result.error,
            }),
        };
        detail.insert(id.clone(), entry);
    }

    if ok_count == 0 {
        return TimeframeVerdict {
            timeframe: tf,
            status: AgentStatus::Failed,
            bias: Bias::Neutral,
            confidence: 0.0,
            detail: serde_json::Value::Object(detail),
        };
    }

    let total = bull_score + bear_score;
    let (bias, confidence) = if total <= 0.0 {
        (Bias::Neutral, 35.0)
    } else if bull_score > bear_score {
        (Bias::Bullish, (bull_score / total * 100.0).min(95.0))
    } else if bear_score > bull_score {
        (Bias::Bearish, (bear_score / total * 100.0).min(95.0))
    } else {
        (Bias::Neutral, 40.0)
    };

    TimeframeVerdict {
        timeframe: tf,
        status: AgentStatus::Ok,
        bias,
        confidence,
        detail: serde_json::Value::Object(detail),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(tf: Timeframe, status: AgentStatus, bias: Bias) -> TimeframeVerdict {
        TimeframeVerdict {
            timeframe: tf,
            status,
            bias,
            confidence: 70.0,
            detail: serde_json::json!({}),
        }
    }

    #[test]
    fn alignment_five_of_six_bullish() {
        let agg = MtfAggregator::new();
        let verdicts: Vec<TimeframeVerdict> = MTF_TIMEFRAMES
            .iter()
            .enumerate()
            .map(|(i, &tf)| {
                let bias = if i < 5 { Bias::Bullish } else { Bias::Bearish };
                verdict(tf, AgentStatus::Ok, bias)
            })
            .collect();

        let summary = agg.summarise("ACME", verdicts);
        assert_eq!(summary.used_timeframes, 6);
        assert!((summary.alignment - 4.0 / 6.0).abs() < 1e-9);
        assert_eq!(summary.dominant_bias, Bias::Bullish);
        assert!(summary.confidence_boost > 0.0);
    }

    #[test]
    fn failed_timeframes_excluded_from_denominator() {
        let agg = MtfAggregator::new();
        let verdicts = vec![
            verdict(Timeframe::M1, AgentStatus::Ok, Bias::Bullish),
            verdict(Timeframe::M5, AgentStatus::Ok, Bias::Bullish),
            verdict(Timeframe::M15, AgentStatus::Failed, Bias::Neutral),
            verdict(Timeframe::H1, AgentStatus::Ok, Bias::Bearish),
        ];
        let summary = agg.summarise("ACME", verdicts);
        assert_eq!(summary.used_timeframes, 3);
        assert!((summary.alignment - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn excluded_timeframe_conflicts_only_with_disagreeing_memory() {
        let agg = MtfAggregator::new();

        // First pass: H1 was ok and bearish.
        let summary = agg.summarise(
            "ACME",
            vec![
                verdict(Timeframe::M5, AgentStatus::Ok, Bias::Bullish),
                verdict(Timeframe::H1, AgentStatus::Ok, Bias::Bearish),
            ],
        );
        assert!(summary.conflicting_timeframes.is_empty());

        // Second pass: H1 failed, majority bullish, remembered bias
        // disagrees.
        let summary = agg.summarise(
            "ACME",
            vec![
                verdict(Timeframe::M5, AgentStatus::Ok, Bias::Bullish),
                verdict(Timeframe::M15, AgentStatus::Ok, Bias::Bullish),
                verdict(Timeframe::H1, AgentStatus::Failed, Bias::Neutral),
            ],
        );
        assert_eq!(summary.conflicting_timeframes, vec![Timeframe::H1]);

        // A failed timeframe with agreeing memory is not conflicting.
        let summary = agg.summarise(
            "ACME",
            vec![
                verdict(Timeframe::M5, AgentStatus::Ok, Bias::Bearish),
                verdict(Timeframe::M15, AgentStatus::Ok, Bias::Bearish),
                verdict(Timeframe::H1, AgentStatus::Failed, Bias::Neutral),
            ],
        );
        assert!(summary.conflicting_timeframes.is_empty());
    }

    #[test]
    fn no_memory_no_conflict() {
        let agg = MtfAggregator::new();
        let summary = agg.summarise(
            "FRESH",
            vec![
                verdict(Timeframe::M5, AgentStatus::Ok, Bias::Bullish),
                verdict(Timeframe::H1, AgentStatus::Failed, Bias::Neutral),
            ],
        );
        assert!(summary.conflicting_timeframes.is_empty());
    }

    #[test]
    fn verdict_vote_weighs_confidence() {
        let mut results = HashMap::new();
        results.insert(
            "a".to_string(),
            AgentResult::ok("a", 90.0, serde_json::json!({"bias": "Bullish"}), 1),
        );
        results.insert(
            "b".to_string(),
            AgentResult::ok("b", 30.0, serde_json::json!({"bias": "Bearish"}), 1),
        );
        results.insert("c".to_string(), AgentResult::failed("c", "x", 1));

        let v = verdict_from_results(Timeframe::M5, &results);
        assert_eq!(v.status, AgentStatus::Ok);
        assert_eq!(v.bias, Bias::Bullish);
        assert!(v.confidence > 50.0);
        assert!(v.detail["c"]["status"] == "unavailable");
    }

    #[test]
    fn all_failed_results_fail_the_timeframe() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), AgentResult::failed("a", "x", 1));
        let v = verdict_from_results(Timeframe::M5, &results);
        assert_eq!(v.status, AgentStatus::Failed);
        assert_eq!(v.bias, Bias::Neutral);
    }
}
