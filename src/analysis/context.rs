// =============================================================================
// Context Builder — bounded, structured input for the synthesizer
// =============================================================================
//
// Rules:
//   1. `prior_trading_levels` is copied verbatim from the indicator stage;
//      it is the consistency anchor.
//   2. Failed/skipped agent sections appear as explicit
//      `{status: "unavailable", reason}` — never silently omitted.
//   3. Prices round to the tick size when known (else 4 decimals),
//      percentage-like fields to 2 decimals.
//   4. Over the size ceiling, sections drop lowest-value first: raw pattern
//      geometry, then extended MTF per-timeframe detail, then the sector
//      correlation matrix. `prior_trading_levels` and `current_price` are
//      never dropped.
// =============================================================================

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::analysis::agent::AgentResult;
use crate::analysis::agents::{insight, ml, patterns, sector, technical, volume};
use crate::analysis::levels::PriorTradingLevels;
use crate::analysis::mtf::MtfSummary;
use crate::llm::prompt::approx_tokens;

// =============================================================================
// Output
// =============================================================================

pub struct ContextDocument {
    pub value: Value,
    pub serialized: String,
    pub approx_tokens: usize,
    pub dropped_sections: Vec<&'static str>,
}

// =============================================================================
// Builder
// =============================================================================

pub struct ContextArgs<'a> {
    pub symbol: &'a str,
    pub current_price: f64,
    pub tick_size: Option<f64>,
    pub data_quality: Value,
    pub agent_results: &'a HashMap<String, AgentResult>,
    pub mtf: &'a MtfSummary,
    pub prior_levels: &'a PriorTradingLevels,
}

pub struct ContextBuilder {
    /// Serialized-context ceiling in approximate tokens (LLM input budget
    /// less headroom, scaled for the instruction preamble).
    pub budget_tokens: usize,
}

impl ContextBuilder {
    pub fn new(budget_tokens: usize) -> Self {
        Self { budget_tokens }
    }

    pub fn build(&self, args: &ContextArgs<'_>) -> ContextDocument {
        let section = |id: &str| agent_section(args.agent_results, id, args.tick_size);

        let technical_signals = json!({
            "trend_following": section(technical::TREND_ID),
            "momentum": section(technical::MOMENTUM_ID),
            "volatility": section(technical::VOLATILITY_ID),
            "trend_strength": section(technical::TREND_STRENGTH_ID),
            "support_resistance": section(technical::SUPPORT_RESISTANCE_ID),
            "insight": section(insight::INSIGHT_ID),
        });
        let pattern_signals = json!({
            "chart_patterns": section(patterns::CHART_PATTERNS_ID),
            "candlestick_patterns": section(patterns::CANDLESTICK_ID),
        });
        let volume_signals = json!({
            "volume_regime": section(volume::VOLUME_REGIME_ID),
        });
        let sector_signals = json!({
            "sector_benchmark": section(sector::SECTOR_ID),
        });
        let ml_signals = json!({
            "ml_predictor": section(ml::ML_ID),
        });

        let mtf_signals = serde_json::to_value(args.mtf).unwrap_or_else(|_| json!({}));

        let mut root = Map::new();
        root.insert("symbol".into(), json!(args.symbol));
        root.insert(
            "current_price".into(),
            json!(crate::analysis::levels::round_price(
                args.current_price,
                args.tick_size
            )),
        );
        root.insert("data_quality".into(), args.data_quality.clone());
        root.insert("technical_signals".into(), technical_signals);
        root.insert("pattern_signals".into(), pattern_signals);
        root.insert("volume_signals".into(), volume_signals);
        root.insert("mtf_signals".into(), round_numbers(mtf_signals, args.tick_size));
        root.insert("sector_signals".into(), sector_signals);
        root.insert("ml_signals".into(), ml_signals);
        // Verbatim: no rounding pass over the anchor.
        root.insert(
            "prior_trading_levels".into(),
            serde_json::to_value(args.prior_levels).unwrap_or_else(|_| json!({})),
        );

        let mut value = Value::Object(root);
        let mut dropped: Vec<&'static str> = Vec::new();

        // Size ceiling enforcement, lowest-value sections first.
        for (name, drop_fn) in DROP_ORDER {
            if approx_tokens(&value.to_string()) <= self.budget_tokens {
                break;
            }
            if drop_fn(&mut value) {
                debug!(section = name, "context section dropped for size");
                dropped.push(name);
            }
        }

        let serialized = value.to_string();
        let tokens = approx_tokens(&serialized);
        ContextDocument {
            value,
            serialized,
            approx_tokens: tokens,
            dropped_sections: dropped,
        }
    }
}

/// One agent's context section: rounded payload for ok results, an explicit
/// unavailability marker otherwise.
fn agent_section(
    results: &HashMap<String, AgentResult>,
    id: &str,
    tick_size: Option<f64>,
) -> Value {
    match results.get(id) {
        Some(result) if result.is_ok() => {
            let mut section = round_numbers(
                result.payload.clone().unwrap_or_else(|| json!({})),
                tick_size,
            );
            if let Value::Object(map) = &mut section {
                map.insert("confidence".into(), json!(round2(result.confidence.unwrap_or(0.0))));
            }
            section
        }
        Some(result) => json!({
            "status": "unavailable",
            "reason": result
                .error
                .clone()
                .unwrap_or_else(|| format!("{:?}", result.status).to_lowercase()),
        }),
        None => json!({
            "status": "unavailable",
            "reason": "not run",
        }),
    }
}

// =============================================================================
// Rounding
// =============================================================================

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Percentage-like keys round to 2 decimals; everything else is treated as
/// a price and rounds to tick size / 4 decimals.
fn is_percent_key(key: &str) -> bool {
    key.ends_with("_pct")
        || key.ends_with("_ratio")
        || key.contains("confidence")
        || key.contains("correlation")
        || key.contains("slope")
        || key.contains("alignment")
        || key.contains("prob")
}

/// Recursively round every number in a JSON tree to its semantic precision.
fn round_numbers(value: Value, tick_size: Option<f64>) -> Value {
    round_inner(value, tick_size, false)
}

fn round_inner(value: Value, tick_size: Option<f64>, percent: bool) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.as_i64().is_none() => {
                let rounded = if percent {
                    round2(f)
                } else {
                    crate::analysis::levels::round_price(f, tick_size)
                };
                serde_json::Number::from_f64(rounded)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            _ => Value::Number(n),
        },
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let pct = is_percent_key(&k);
                    (k, round_inner(v, tick_size, pct))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| round_inner(v, tick_size, percent))
                .collect(),
        ),
        other => other,
    }
}

// =============================================================================
// Drop order
// =============================================================================

type DropFn = fn(&mut Value) -> bool;

/// (section name, mutation) pairs in drop priority order, lowest first.
const DROP_ORDER: [(&str, DropFn); 3] = [
    ("pattern_geometry", drop_pattern_geometry),
    ("mtf_detail", drop_mtf_detail),
    ("sector_correlation_matrix", drop_correlation_matrix),
];

fn drop_pattern_geometry(root: &mut Value) -> bool {
    let mut removed = false;
    if let Some(list) = root
        .pointer_mut("/pattern_signals/chart_patterns/patterns")
        .and_then(Value::as_array_mut)
    {
        for p in list.iter_mut() {
            if let Value::Object(map) = p {
                removed |= map.remove("geometry").is_some();
            }
        }
    }
    removed
}

fn drop_mtf_detail(root: &mut Value) -> bool {
    let mut removed = false;
    if let Some(list) = root
        .pointer_mut("/mtf_signals/per_timeframe")
        .and_then(Value::as_array_mut)
    {
        for v in list.iter_mut() {
            if let Value::Object(map) = v {
                removed |= map.remove("detail").is_some();
            }
        }
    }
    removed
}

fn drop_correlation_matrix(root: &mut Value) -> bool {
    root.pointer_mut("/sector_signals/sector_benchmark")
        .and_then(Value::as_object_mut)
        .map(|map| map.remove("correlation_matrix").is_some())
        .unwrap_or(false)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::levels::derive_prior_levels;
    use crate::types::Bias;

    fn sample_results() -> HashMap<String, AgentResult> {
        let mut results = HashMap::new();
        results.insert(
            technical::TREND_ID.to_string(),
            AgentResult::ok(
                technical::TREND_ID,
                78.123,
                json!({"bias": "Bullish", "ema_9": 101.123456789, "separation_pct": 1.23456}),
                5,
            ),
        );
        results.insert(
            patterns::CHART_PATTERNS_ID.to_string(),
            AgentResult::ok(
                patterns::CHART_PATTERNS_ID,
                60.0,
                json!({"bias": "Bullish", "patterns": [
                    {"name": "ascending_structure", "geometry": {"segment_highs": [1.0, 2.0]}}
                ]}),
                5,
            ),
        );
        results.insert(
            sector::SECTOR_ID.to_string(),
            AgentResult::ok(
                sector::SECTOR_ID,
                55.0,
                json!({"bias": "Neutral", "correlation_matrix": [{"window": 10, "correlation": 0.912345}]}),
                5,
            ),
        );
        results.insert(
            ml::ML_ID.to_string(),
            AgentResult::failed(ml::ML_ID, "deterministic failure", 3),
        );
        results
    }

    fn args<'a>(
        results: &'a HashMap<String, AgentResult>,
        mtf: &'a MtfSummary,
        prior: &'a PriorTradingLevels,
    ) -> ContextArgs<'a> {
        ContextArgs {
            symbol: "ACME",
            current_price: 100.123456,
            tick_size: None,
            data_quality: json!({"candle_count": 120, "source_class": "live"}),
            agent_results: results,
            mtf,
            prior_levels: prior,
        }
    }

    fn prior() -> PriorTradingLevels {
        derive_prior_levels(100.0, 2.0, [Bias::Bullish; 3], None)
    }

    #[test]
    fn failed_sections_are_explicit() {
        let results = sample_results();
        let mtf = MtfSummary::unavailable("test");
        let prior = prior();
        let doc = ContextBuilder::new(100_000).build(&args(&results, &mtf, &prior));

        assert_eq!(
            doc.value["ml_signals"]["ml_predictor"]["status"],
            "unavailable"
        );
        assert_eq!(
            doc.value["ml_signals"]["ml_predictor"]["reason"],
            "deterministic failure"
        );
        // Not-run agents are explicit too.
        assert_eq!(
            doc.value["volume_signals"]["volume_regime"]["status"],
            "unavailable"
        );
    }

    #[test]
    fn prior_levels_copied_verbatim() {
        let results = sample_results();
        let mtf = MtfSummary::unavailable("test");
        let prior = prior();
        let doc = ContextBuilder::new(100_000).build(&args(&results, &mtf, &prior));

        let expected = serde_json::to_value(&prior).unwrap();
        assert_eq!(doc.value["prior_trading_levels"], expected);
    }

    #[test]
    fn numbers_are_rounded() {
        let results = sample_results();
        let mtf = MtfSummary::unavailable("test");
        let prior = prior();
        let doc = ContextBuilder::new(100_000).build(&args(&results, &mtf, &prior));

        let ema = doc.value["technical_signals"]["trend_following"]["ema_9"]
            .as_f64()
            .unwrap();
        assert_eq!(ema, 101.1235);
        let sep = doc.value["technical_signals"]["trend_following"]["separation_pct"]
            .as_f64()
            .unwrap();
        assert_eq!(sep, 1.23);
        assert_eq!(doc.value["current_price"].as_f64().unwrap(), 100.1235);
    }

    #[test]
    fn oversized_context_drops_in_priority_order() {
        let mut results = sample_results();
        // Inflate the geometry so the first drop matters.
        results.insert(
            patterns::CHART_PATTERNS_ID.to_string(),
            AgentResult::ok(
                patterns::CHART_PATTERNS_ID,
                60.0,
                json!({"bias": "Bullish", "patterns": [
                    {"name": "big", "geometry": {"points": vec![1.5_f64; 4000]}}
                ]}),
                5,
            ),
        );
        let mtf = MtfSummary::unavailable("test");
        let prior = prior();

        let doc = ContextBuilder::new(2_000).build(&args(&results, &mtf, &prior));
        assert!(doc.dropped_sections.contains(&"pattern_geometry"));
        // The anchor survives every drop.
        assert!(doc.value.get("prior_trading_levels").is_some());
        assert!(doc.value.get("current_price").is_some());
        // Geometry is gone from the payload.
        assert!(doc.value["pattern_signals"]["chart_patterns"]["patterns"][0]
            .get("geometry")
            .is_none());
    }

    #[test]
    fn tiny_budget_still_keeps_anchor() {
        let results = sample_results();
        let mtf = MtfSummary::unavailable("test");
        let prior = prior();
        let doc = ContextBuilder::new(10).build(&args(&results, &mtf, &prior));

        // All three droppable sections went; the anchor remains.
        assert_eq!(doc.dropped_sections.len(), 3);
        let expected = serde_json::to_value(&prior).unwrap();
        assert_eq!(doc.value["prior_trading_levels"], expected);
    }
}
