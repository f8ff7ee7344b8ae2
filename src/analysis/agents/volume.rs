// =============================================================================
// Volume Regime Analyzer — participation, OBV slope, accumulation read
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::analysis::agent::{
    AgentOutcome, AnalysisInputs, Analyzer, AnalyzerSpec, CostClass, RequiredInputs,
};
use crate::llm::ModelTier;
use crate::market_data::aggregator::Candle;
use crate::types::Bias;

pub const VOLUME_REGIME_ID: &str = "volume_regime";

static VOLUME_SPEC: AnalyzerSpec = AnalyzerSpec {
    id: VOLUME_REGIME_ID,
    required_inputs: RequiredInputs::candles_and_indicators(),
    timeout_ms: 5_000,
    cost_class: CostClass::Cheap,
    model_preference: ModelTier::Auto,
};

pub struct VolumeRegimeAnalyzer;

#[async_trait]
impl Analyzer for VolumeRegimeAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &VOLUME_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let candles = inputs.candles.as_slice();
        if candles.len() < 25 {
            anyhow::bail!("insufficient candles for volume analysis");
        }

        let volume_ratio = inputs.indicators.volume_ratio.unwrap_or(1.0);
        let obv = on_balance_volume(candles);
        let obv_slope = series_slope(&obv[obv.len().saturating_sub(20)..]);

        // Price direction over the same window, for divergence checks.
        let price_slope = {
            let closes: Vec<f64> = candles[candles.len() - 20..].iter().map(|c| c.close).collect();
            series_slope(&closes)
        };

        let regime = classify(obv_slope, price_slope);
        let bias = match regime {
            "accumulation" => Bias::Bullish,
            "distribution" => Bias::Bearish,
            _ => Bias::Neutral,
        };

        let participation = if volume_ratio > 1.5 {
            "elevated"
        } else if volume_ratio < 0.6 {
            "thin"
        } else {
            "normal"
        };

        let confidence = if bias == Bias::Neutral {
            40.0
        } else {
            (50.0 + volume_ratio.min(3.0) * 10.0).min(88.0)
        };

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "regime": regime,
                "participation": participation,
                "volume_ratio": volume_ratio,
                "obv_slope": obv_slope,
            }),
            model: None,
        })
    }
}

/// OBV series: running total adding volume on up closes, subtracting on
/// down closes.
fn on_balance_volume(candles: &[Candle]) -> Vec<f64> {
    let mut obv = Vec::with_capacity(candles.len());
    let mut total = 0.0;
    obv.push(total);
    for w in candles.windows(2) {
        if w[1].close > w[0].close {
            total += w[1].volume;
        } else if w[1].close < w[0].close {
            total -= w[1].volume;
        }
        obv.push(total);
    }
    obv
}

/// Least-squares slope of a series, normalised by its mean magnitude so
/// different scales compare.
fn series_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n_f;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        return 0.0;
    }
    let slope = num / den;
    let scale = y_mean.abs().max(1.0);
    slope / scale
}

fn classify(obv_slope: f64, price_slope: f64) -> &'static str {
    const FLAT: f64 = 1e-6;
    if obv_slope > FLAT && price_slope >= -FLAT {
        "accumulation"
    } else if obv_slope < -FLAT && price_slope <= FLAT {
        "distribution"
    } else if obv_slope.signum() != price_slope.signum() {
        "divergent"
    } else {
        "neutral"
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::agent::AgentResult;
    use crate::indicators::compute_baseline;
    use crate::types::Timeframe;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn candles_with(close_step: f64, volume: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * close_step;
                Candle {
                    token: 1,
                    timeframe: Timeframe::M5,
                    start: i as i64 * 300_000,
                    end: (i as i64 + 1) * 300_000,
                    open: base - 0.1,
                    high: base + 0.5,
                    low: base - 0.5,
                    close: base,
                    volume,
                }
            })
            .collect()
    }

    fn inputs_from(candles: Vec<Candle>) -> AnalysisInputs {
        let indicators = compute_baseline(&candles);
        AnalysisInputs {
            symbol: "ACME".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M5,
            current_price: indicators.current_price,
            candles: Arc::new(candles),
            indicators: Arc::new(indicators),
            tick_size: None,
            prior: Arc::new(HashMap::<String, AgentResult>::new()),
        }
    }

    #[tokio::test]
    async fn rising_price_and_volume_reads_accumulation() {
        let out = VolumeRegimeAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles_with(0.5, 150.0, 60)))
            .await
            .unwrap();
        assert_eq!(out.payload["regime"], "accumulation");
        assert_eq!(out.payload["bias"], "Bullish");
    }

    #[tokio::test]
    async fn falling_price_reads_distribution() {
        let out = VolumeRegimeAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles_with(-0.5, 150.0, 60)))
            .await
            .unwrap();
        assert_eq!(out.payload["regime"], "distribution");
        assert_eq!(out.payload["bias"], "Bearish");
    }

    #[tokio::test]
    async fn short_series_errors() {
        let result = VolumeRegimeAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles_with(0.5, 100.0, 10)))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn obv_accumulates_by_close_direction() {
        let candles = candles_with(1.0, 10.0, 5);
        let obv = on_balance_volume(&candles);
        assert_eq!(obv.len(), 5);
        assert!((obv[4] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn slope_signs() {
        assert!(series_slope(&[1.0, 2.0, 3.0, 4.0]) > 0.0);
        assert!(series_slope(&[4.0, 3.0, 2.0, 1.0]) < 0.0);
        assert_eq!(series_slope(&[5.0]), 0.0);
    }
}
