// =============================================================================
// Decision types and the persisted record
// =============================================================================
//
// `Decision` is the in-memory output of the synthesizer. `DecisionRecord`
// is the persistable shape; its field names are part of the storage
// contract and must not drift.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::analysis::agent::AgentResult;
use crate::market_data::aggregator::Candle;
use crate::types::{Bias, Horizon};

// =============================================================================
// Horizon plan
// =============================================================================

/// Per-horizon trading plan inside a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonPlan {
    pub bias: Bias,
    pub confidence_pct: f64,
    pub entry_range: [f64; 2],
    pub stop_loss: f64,
    pub targets: Vec<f64>,
    pub rationale: String,
}

// =============================================================================
// Decision
// =============================================================================

/// Degradation flags a UI must check to render reduced confidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionMeta {
    /// One or more analyzers failed, timed out, or were skipped.
    pub partial: bool,
    /// The synthesizer fell back to the deterministic decision.
    pub llm_fallback: bool,
    /// `"levels_forced"` when prior levels were forced after repeated
    /// validation failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<String>,
    /// Model that produced the synthesis, when the LLM was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub request_id: String,
    pub duration_ms: u64,
}

/// The final reconciled output of one analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    /// UTC ms epoch of synthesis.
    pub timestamp: i64,
    pub trend: Bias,
    pub confidence_pct: f64,
    pub short_term: HorizonPlan,
    pub medium_term: HorizonPlan,
    pub long_term: HorizonPlan,
    pub risks: Vec<String>,
    pub must_watch_levels: Vec<f64>,
    pub mtf_context: serde_json::Value,
    pub sector_context: serde_json::Value,
    pub meta: DecisionMeta,
}

impl Decision {
    pub fn horizon(&self, horizon: Horizon) -> &HorizonPlan {
        match horizon {
            Horizon::ShortTerm => &self.short_term,
            Horizon::MediumTerm => &self.medium_term,
            Horizon::LongTerm => &self.long_term,
        }
    }
}

/// Decision-level confidence: the shortest horizon weighs heaviest.
/// round(0.5 * short + 0.3 * medium + 0.2 * long).
pub fn weighted_confidence(short: f64, medium: f64, long: f64) -> f64 {
    (0.5 * short + 0.3 * medium + 0.2 * long).round()
}

/// Decision trend from horizon biases: Bullish/Bearish requires at least
/// two horizons agreeing; anything else is Neutral.
pub fn trend_from_horizons(biases: [Bias; 3]) -> Bias {
    let bulls = biases.iter().filter(|b| **b == Bias::Bullish).count();
    let bears = biases.iter().filter(|b| **b == Bias::Bearish).count();
    if bulls >= 2 {
        Bias::Bullish
    } else if bears >= 2 {
        Bias::Bearish
    } else {
        Bias::Neutral
    }
}

// =============================================================================
// Persisted record
// =============================================================================

/// The `ai_analysis` block of the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub trend: Bias,
    pub confidence_pct: f64,
    pub short_term: HorizonPlan,
    pub medium_term: HorizonPlan,
    pub long_term: HorizonPlan,
    pub risks: Vec<String>,
    pub must_watch_levels: Vec<f64>,
    pub trading_strategy: String,
}

/// Canonical persisted decision record. Field names are the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub stock_symbol: String,
    pub exchange: String,
    pub analysis_timestamp: i64,
    pub analysis_type: String,
    pub current_price: f64,
    pub ai_analysis: AiAnalysis,
    pub signals: serde_json::Value,
    pub sector_context: serde_json::Value,
    pub mtf_context: serde_json::Value,
    pub meta: DecisionMeta,
}

impl DecisionRecord {
    pub fn from_decision(
        decision: &Decision,
        exchange: &str,
        analysis_type: &str,
        current_price: f64,
        signals: serde_json::Value,
        trading_strategy: String,
    ) -> Self {
        Self {
            stock_symbol: decision.symbol.clone(),
            exchange: exchange.to_string(),
            analysis_timestamp: decision.timestamp,
            analysis_type: analysis_type.to_string(),
            current_price,
            ai_analysis: AiAnalysis {
                trend: decision.trend,
                confidence_pct: decision.confidence_pct,
                short_term: decision.short_term.clone(),
                medium_term: decision.medium_term.clone(),
                long_term: decision.long_term.clone(),
                risks: decision.risks.clone(),
                must_watch_levels: decision.must_watch_levels.clone(),
                trading_strategy,
            },
            signals,
            sector_context: decision.sector_context.clone(),
            mtf_context: decision.mtf_context.clone(),
            meta: decision.meta.clone(),
        }
    }
}

/// Everything worth persisting alongside a decision for later replay.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisArtifact {
    pub candles: Vec<Candle>,
    pub agent_results: HashMap<String, AgentResult>,
    pub record: DecisionRecord,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_confidence_formula() {
        assert_eq!(weighted_confidence(80.0, 70.0, 60.0), 73.0);
        assert_eq!(weighted_confidence(100.0, 100.0, 100.0), 100.0);
        assert_eq!(weighted_confidence(0.0, 0.0, 0.0), 0.0);
        // 0.5*90 + 0.3*50 + 0.2*10 = 45 + 15 + 2 = 62
        assert_eq!(weighted_confidence(90.0, 50.0, 10.0), 62.0);
    }

    #[test]
    fn trend_needs_two_agreeing_horizons() {
        use Bias::*;
        assert_eq!(trend_from_horizons([Bullish, Bullish, Bearish]), Bullish);
        assert_eq!(trend_from_horizons([Bearish, Bearish, Neutral]), Bearish);
        assert_eq!(trend_from_horizons([Bullish, Bearish, Neutral]), Neutral);
        assert_eq!(trend_from_horizons([Neutral, Neutral, Bullish]), Neutral);
        assert_eq!(trend_from_horizons([Bullish, Bullish, Bullish]), Bullish);
    }

    #[test]
    fn record_field_names_are_stable() {
        let plan = HorizonPlan {
            bias: Bias::Bullish,
            confidence_pct: 75.0,
            entry_range: [99.0, 101.0],
            stop_loss: 97.0,
            targets: vec![105.0, 109.0],
            rationale: "trend alignment".into(),
        };
        let decision = Decision {
            symbol: "ACME".into(),
            timestamp: 1_700_000_000_000,
            trend: Bias::Bullish,
            confidence_pct: 75.0,
            short_term: plan.clone(),
            medium_term: plan.clone(),
            long_term: plan,
            risks: vec!["sector rotation".into()],
            must_watch_levels: vec![97.0, 105.0],
            mtf_context: serde_json::json!({}),
            sector_context: serde_json::json!({}),
            meta: DecisionMeta::default(),
        };

        let record = DecisionRecord::from_decision(
            &decision,
            "NSE",
            "full",
            100.0,
            serde_json::json!({"rsi_14": 60.0}),
            "buy pullbacks toward the entry range".into(),
        );
        let json = serde_json::to_value(&record).unwrap();

        for field in [
            "stock_symbol",
            "exchange",
            "analysis_timestamp",
            "analysis_type",
            "current_price",
            "ai_analysis",
            "signals",
            "sector_context",
            "mtf_context",
            "meta",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        for field in [
            "trend",
            "confidence_pct",
            "short_term",
            "medium_term",
            "long_term",
            "risks",
            "must_watch_levels",
            "trading_strategy",
        ] {
            assert!(
                json["ai_analysis"].get(field).is_some(),
                "missing ai_analysis field {field}"
            );
        }
        assert_eq!(json["ai_analysis"]["trend"], "Bullish");
    }
}
