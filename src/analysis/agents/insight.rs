// =============================================================================
// LLM Insight Analyzer — narrative synthesis over the technical payloads
// =============================================================================
//
// The one LLM-backed specialist. It depends on the trend, momentum, and
// volume results, condenses them into a compact prompt, and asks the model
// for a short narrative read with its own bias and confidence. Failure here
// degrades to an unavailable section in the final context, never to a
// failed request.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::analysis::agent::{
    AgentOutcome, AnalysisInputs, Analyzer, AnalyzerSpec, CostClass, RequiredInputs,
};
use crate::analysis::agents::{technical, volume};
use crate::llm::{JsonKind, LlmClient, ModelTier, PromptParts, SchemaSpec};
use crate::llm::client::LlmRequest;
use crate::types::Bias;

pub const INSIGHT_ID: &str = "llm_insight";

static INSIGHT_SPEC: AnalyzerSpec = AnalyzerSpec {
    id: INSIGHT_ID,
    required_inputs: RequiredInputs {
        candles: false,
        indicators: true,
        patterns: false,
        chart_image: false,
        prior_results: &[
            technical::TREND_ID,
            technical::MOMENTUM_ID,
            volume::VOLUME_REGIME_ID,
        ],
    },
    timeout_ms: 50_000,
    cost_class: CostClass::Expensive,
    model_preference: ModelTier::Auto,
};

static INSIGHT_SCHEMA: SchemaSpec = SchemaSpec {
    required: &[
        ("summary", JsonKind::String),
        ("bias", JsonKind::String),
        ("confidence", JsonKind::Number),
    ],
};

pub struct LlmInsightAnalyzer {
    llm: Arc<LlmClient>,
}

impl LlmInsightAnalyzer {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Analyzer for LlmInsightAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &INSIGHT_SPEC
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let mut sections = serde_json::Map::new();
        for dep in INSIGHT_SPEC.required_inputs.prior_results {
            if let Some(result) = inputs.prior.get(*dep) {
                if let Some(payload) = &result.payload {
                    sections.insert(dep.to_string(), payload.clone());
                }
            }
        }
        if sections.is_empty() {
            anyhow::bail!("no upstream payloads available");
        }

        let request = LlmRequest {
            parts: PromptParts {
                preamble: format!(
                    "You are reviewing technical analysis output for {} on the {} timeframe.\n\
                     Summarise what the signals collectively say in 2-3 sentences, then state\n\
                     your directional read.\n\
                     Respond with ONLY a JSON object: {{\"summary\": string,\n\
                     \"bias\": \"Bullish\"|\"Bearish\"|\"Neutral\", \"confidence\": 0-100}}.",
                    inputs.symbol, inputs.timeframe,
                ),
                anchor: format!("Current price: {:.4}", inputs.current_price),
                sections: vec![crate::llm::PromptSection {
                    name: "signal_payloads",
                    body: serde_json::Value::Object(sections).to_string(),
                    priority: 5,
                }],
            },
            system: "You are a concise market analyst. Output JSON only.".to_string(),
            schema: INSIGHT_SCHEMA,
            tier: INSIGHT_SPEC.model_preference,
        };

        let response = self
            .llm
            .generate(&request, cancel)
            .await
            .map_err(|e| anyhow::anyhow!("insight generation failed: {e}"))?;

        let summary = response.value["summary"].as_str().unwrap_or("").to_string();
        let bias = response.value["bias"]
            .as_str()
            .and_then(Bias::parse_lenient)
            .unwrap_or(Bias::Neutral);
        let confidence = response.value["confidence"].as_f64().unwrap_or(50.0);

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "summary": summary,
            }),
            model: Some(response.model),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::agent::AgentResult;
    use crate::indicators::IndicatorSnapshot;
    use crate::llm::client::testing::{Script, ScriptedTransport};
    use crate::runtime_config::LlmConfig;
    use crate::types::Timeframe;
    use std::collections::HashMap;

    fn inputs_with_prior() -> AnalysisInputs {
        let mut prior = HashMap::new();
        prior.insert(
            technical::TREND_ID.to_string(),
            AgentResult::ok(
                technical::TREND_ID,
                75.0,
                json!({"bias": "Bullish", "separation_pct": 1.2}),
                3,
            ),
        );
        prior.insert(
            technical::MOMENTUM_ID.to_string(),
            AgentResult::ok(
                technical::MOMENTUM_ID,
                70.0,
                json!({"bias": "Bullish", "rsi_14": 64.0}),
                2,
            ),
        );
        AnalysisInputs {
            symbol: "ACME".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M15,
            current_price: 100.0,
            candles: Arc::new(Vec::new()),
            indicators: Arc::new(IndicatorSnapshot::default()),
            tick_size: None,
            prior: Arc::new(prior),
        }
    }

    fn llm(script: Vec<Script>) -> Arc<LlmClient> {
        Arc::new(LlmClient::new(
            Arc::new(ScriptedTransport::new(script)),
            LlmConfig {
                max_attempts: 1,
                ..LlmConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn narrative_parsed_into_payload() {
        let analyzer = LlmInsightAnalyzer::new(llm(vec![Script::Ok(
            r#"{"summary": "Momentum and trend agree to the upside.", "bias": "bullish", "confidence": 72}"#,
        )]));
        let out = analyzer
            .run(&CancellationToken::new(), &inputs_with_prior())
            .await
            .unwrap();
        assert_eq!(out.payload["bias"], "Bullish");
        assert!(out.confidence > 70.0);
        assert!(out.model.is_some());
    }

    #[tokio::test]
    async fn llm_failure_propagates_as_error() {
        let analyzer = LlmInsightAnalyzer::new(llm(vec![
            Script::Err("503"),
            Script::Err("503"),
        ]));
        let result = analyzer
            .run(&CancellationToken::new(), &inputs_with_prior())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_prior_errors() {
        let analyzer = LlmInsightAnalyzer::new(llm(vec![Script::Ok("{}")]));
        let mut inputs = inputs_with_prior();
        inputs.prior = Arc::new(HashMap::new());
        assert!(analyzer.run(&CancellationToken::new(), &inputs).await.is_err());
    }
}
