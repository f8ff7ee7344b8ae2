// =============================================================================
// Analyzer contract — specs, inputs, results
// =============================================================================
//
// Every specialist analyzer implements `Analyzer`: a declared spec plus an
// async `run` over a read-only inputs bundle. Analyzers share no mutable
// state; the executor hands each one a cloned view and collects immutable
// `AgentResult`s.
//
// AgentResult invariants are enforced by construction:
//   status == ok   => payload present, confidence present, error absent
//   status != ok   => payload absent, confidence absent
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::indicators::IndicatorSnapshot;
use crate::llm::ModelTier;
use crate::market_data::aggregator::Candle;
use crate::types::Timeframe;

// =============================================================================
// Status & result
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Ok,
    Failed,
    Skipped,
    Timeout,
}

/// Immutable outcome of one analyzer run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub status: AgentStatus,
    /// Present iff status == ok; clamped to [0, 100].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Present iff status == ok.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Which model produced the output, for LLM-backed analyzers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentResult {
    pub fn ok(
        agent_id: impl Into<String>,
        confidence: f64,
        payload: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Ok,
            confidence: Some(confidence.clamp(0.0, 100.0)),
            payload: Some(payload),
            error: None,
            duration_ms,
            model: None,
        }
    }

    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Failed,
            confidence: None,
            payload: None,
            error: Some(error.into()),
            duration_ms,
            model: None,
        }
    }

    pub fn skipped(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Skipped,
            confidence: None,
            payload: None,
            error: Some(reason.into()),
            duration_ms: 0,
            model: None,
        }
    }

    pub fn timed_out(agent_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Timeout,
            confidence: None,
            payload: None,
            error: Some("analyzer timed out".into()),
            duration_ms,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == AgentStatus::Ok
    }

    /// The `bias` field from an ok payload, when present.
    pub fn payload_bias(&self) -> Option<crate::types::Bias> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("bias"))
            .and_then(|b| b.as_str())
            .and_then(crate::types::Bias::parse_lenient)
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Relative execution cost, used for logging and future scheduling hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Cheap,
    Standard,
    Expensive,
}

/// What an analyzer needs before it can run.
#[derive(Debug, Clone, Copy)]
pub struct RequiredInputs {
    pub candles: bool,
    pub indicators: bool,
    pub patterns: bool,
    pub chart_image: bool,
    /// Analyzer ids whose results must be available first. A failed
    /// dependency marks this analyzer `skipped`.
    pub prior_results: &'static [&'static str],
}

impl RequiredInputs {
    pub const fn candles_and_indicators() -> Self {
        Self {
            candles: true,
            indicators: true,
            patterns: false,
            chart_image: false,
            prior_results: &[],
        }
    }
}

/// Static declaration of one analyzer.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSpec {
    pub id: &'static str,
    pub required_inputs: RequiredInputs,
    pub timeout_ms: u64,
    pub cost_class: CostClass,
    pub model_preference: ModelTier,
}

// =============================================================================
// Inputs
// =============================================================================

/// Read-only bundle shared by all analyzers of one request. Cloning is
/// cheap (Arc'd interior).
#[derive(Clone)]
pub struct AnalysisInputs {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: Timeframe,
    pub current_price: f64,
    pub candles: Arc<Vec<Candle>>,
    pub indicators: Arc<IndicatorSnapshot>,
    pub tick_size: Option<f64>,
    /// Results of already-completed analyzers, for dependents.
    pub prior: Arc<HashMap<String, AgentResult>>,
}

impl AnalysisInputs {
    pub fn with_prior(&self, prior: HashMap<String, AgentResult>) -> Self {
        let mut next = self.clone();
        next.prior = Arc::new(prior);
        next
    }
}

// =============================================================================
// Analyzer trait & outcome
// =============================================================================

/// What a successful analyzer run returns; the executor wraps it into an
/// `AgentResult` with status and timing.
pub struct AgentOutcome {
    pub confidence: f64,
    pub payload: serde_json::Value,
    pub model: Option<String>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn spec(&self) -> &AnalyzerSpec;

    /// Run the analysis. Cancellation must be observed at I/O boundaries;
    /// pure-CPU analyzers may ignore the token.
    async fn run(
        &self,
        cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_carries_payload_and_confidence() {
        let r = AgentResult::ok("trend", 82.5, serde_json::json!({"bias": "Bullish"}), 12);
        assert!(r.is_ok());
        assert_eq!(r.confidence, Some(82.5));
        assert!(r.payload.is_some());
        assert!(r.error.is_none());
        assert_eq!(r.payload_bias(), Some(crate::types::Bias::Bullish));
    }

    #[test]
    fn confidence_clamped() {
        let r = AgentResult::ok("x", 150.0, serde_json::json!({}), 0);
        assert_eq!(r.confidence, Some(100.0));
        let r = AgentResult::ok("x", -3.0, serde_json::json!({}), 0);
        assert_eq!(r.confidence, Some(0.0));
    }

    #[test]
    fn non_ok_results_have_no_payload() {
        let failed = AgentResult::failed("x", "boom", 5);
        assert_eq!(failed.status, AgentStatus::Failed);
        assert!(failed.payload.is_none());
        assert!(failed.confidence.is_none());

        let skipped = AgentResult::skipped("x", "dep failed");
        assert_eq!(skipped.status, AgentStatus::Skipped);
        assert!(skipped.payload.is_none());

        let timeout = AgentResult::timed_out("x", 20_000);
        assert_eq!(timeout.status, AgentStatus::Timeout);
        assert!(timeout.payload.is_none());
    }

    #[test]
    fn status_serialises_lowercase() {
        let r = AgentResult::timed_out("x", 1);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "timeout");
    }
}
