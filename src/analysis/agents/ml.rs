// =============================================================================
// ML Predictor Analyzer — logistic blend over normalised features
// =============================================================================
//
// A deterministic linear model with fixed weights, squashed through a
// sigmoid into an up-move probability. The weights were fit offline; the
// engine only evaluates.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::analysis::agent::{
    AgentOutcome, AnalysisInputs, Analyzer, AnalyzerSpec, CostClass, RequiredInputs,
};
use crate::llm::ModelTier;
use crate::types::Bias;

pub const ML_ID: &str = "ml_predictor";

static ML_SPEC: AnalyzerSpec = AnalyzerSpec {
    id: ML_ID,
    required_inputs: RequiredInputs::candles_and_indicators(),
    timeout_ms: 10_000,
    cost_class: CostClass::Standard,
    model_preference: ModelTier::Auto,
};

/// Feature weights of the offline-fitted model, in feature order:
/// rsi_lean, ema_separation, roc, volume_ratio_excess.
const WEIGHTS: [f64; 4] = [0.045, 0.35, 0.08, 0.25];
const INTERCEPT: f64 = 0.0;
const MODEL_VERSION: &str = "argus-logit-v2";

pub struct MlPredictorAnalyzer;

#[async_trait]
impl Analyzer for MlPredictorAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &ML_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let ind = &inputs.indicators;
        let rsi = ind
            .rsi_14
            .ok_or_else(|| anyhow::anyhow!("insufficient candles for feature extraction"))?;

        let ema_sep = match (ind.ema_9, ind.ema_55) {
            (Some(fast), Some(slow)) if slow.abs() > f64::EPSILON => {
                (fast - slow) / slow * 100.0
            }
            _ => 0.0,
        };
        let roc = ind.roc_14.unwrap_or(0.0);
        let vol_excess = ind.volume_ratio.map(|r| r - 1.0).unwrap_or(0.0);

        let features = [rsi - 50.0, ema_sep, roc, vol_excess];
        let z: f64 = INTERCEPT
            + features
                .iter()
                .zip(WEIGHTS.iter())
                .map(|(f, w)| f * w)
                .sum::<f64>();
        let prob_up = sigmoid(z);

        let bias = if prob_up > 0.58 {
            Bias::Bullish
        } else if prob_up < 0.42 {
            Bias::Bearish
        } else {
            Bias::Neutral
        };

        // Distance from coin-flip maps to confidence.
        let confidence = (50.0 + (prob_up - 0.5).abs() * 160.0).min(90.0);

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "prob_up": prob_up,
                "model_version": MODEL_VERSION,
                "features": {
                    "rsi_lean": features[0],
                    "ema_separation_pct": features[1],
                    "roc_14": features[2],
                    "volume_ratio_excess": features[3],
                },
            }),
            model: None,
        })
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::agent::AgentResult;
    use crate::indicators::IndicatorSnapshot;
    use crate::types::Timeframe;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn inputs_with(snapshot: IndicatorSnapshot) -> AnalysisInputs {
        AnalysisInputs {
            symbol: "ACME".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M5,
            current_price: snapshot.current_price,
            candles: Arc::new(Vec::new()),
            indicators: Arc::new(snapshot),
            tick_size: None,
            prior: Arc::new(HashMap::<String, AgentResult>::new()),
        }
    }

    #[test]
    fn sigmoid_bounds() {
        assert!(sigmoid(-50.0) < 0.001);
        assert!(sigmoid(50.0) > 0.999);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn strong_features_predict_up() {
        let snap = IndicatorSnapshot {
            current_price: 100.0,
            rsi_14: Some(68.0),
            ema_9: Some(104.0),
            ema_55: Some(100.0),
            roc_14: Some(4.0),
            volume_ratio: Some(1.8),
            ..IndicatorSnapshot::default()
        };
        let out = MlPredictorAnalyzer
            .run(&CancellationToken::new(), &inputs_with(snap))
            .await
            .unwrap();
        assert_eq!(out.payload["bias"], "Bullish");
        assert!(out.payload["prob_up"].as_f64().unwrap() > 0.58);
    }

    #[tokio::test]
    async fn weak_features_predict_down() {
        let snap = IndicatorSnapshot {
            current_price: 100.0,
            rsi_14: Some(31.0),
            ema_9: Some(96.0),
            ema_55: Some(100.0),
            roc_14: Some(-4.0),
            volume_ratio: Some(0.7),
            ..IndicatorSnapshot::default()
        };
        let out = MlPredictorAnalyzer
            .run(&CancellationToken::new(), &inputs_with(snap))
            .await
            .unwrap();
        assert_eq!(out.payload["bias"], "Bearish");
    }

    #[tokio::test]
    async fn balanced_features_stay_neutral() {
        let snap = IndicatorSnapshot {
            current_price: 100.0,
            rsi_14: Some(50.0),
            ema_9: Some(100.0),
            ema_55: Some(100.0),
            roc_14: Some(0.0),
            volume_ratio: Some(1.0),
            ..IndicatorSnapshot::default()
        };
        let out = MlPredictorAnalyzer
            .run(&CancellationToken::new(), &inputs_with(snap))
            .await
            .unwrap();
        assert_eq!(out.payload["bias"], "Neutral");
    }

    #[tokio::test]
    async fn missing_rsi_errors() {
        let result = MlPredictorAnalyzer
            .run(
                &CancellationToken::new(),
                &inputs_with(IndicatorSnapshot::default()),
            )
            .await;
        assert!(result.is_err());
    }
}
