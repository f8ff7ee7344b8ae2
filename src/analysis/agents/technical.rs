// =============================================================================
// Technical Analyzers — trend, momentum, volatility, strength, levels
// =============================================================================
//
// All five are pure functions of the shared indicator snapshot and candle
// series; they never block and ignore the cancellation token.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::analysis::agent::{
    AgentOutcome, AnalysisInputs, Analyzer, AnalyzerSpec, CostClass, RequiredInputs,
};
use crate::indicators::ema::ema_separation_pct;
use crate::llm::ModelTier;
use crate::types::Bias;

pub const TREND_ID: &str = "trend_following";
pub const MOMENTUM_ID: &str = "momentum";
pub const VOLATILITY_ID: &str = "volatility";
pub const TREND_STRENGTH_ID: &str = "trend_strength";
pub const SUPPORT_RESISTANCE_ID: &str = "support_resistance";

const fn cheap_spec(id: &'static str) -> AnalyzerSpec {
    AnalyzerSpec {
        id,
        required_inputs: RequiredInputs::candles_and_indicators(),
        timeout_ms: 5_000,
        cost_class: CostClass::Cheap,
        model_preference: ModelTier::Auto,
    }
}

// =============================================================================
// Trend following — EMA stack alignment
// =============================================================================

pub struct TrendFollowingAnalyzer;

static TREND_SPEC: AnalyzerSpec = cheap_spec(TREND_ID);

#[async_trait]
impl Analyzer for TrendFollowingAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &TREND_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let ind = &inputs.indicators;
        let (e9, e21, e55) = match (ind.ema_9, ind.ema_21, ind.ema_55) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => anyhow::bail!("insufficient candles for the EMA stack"),
        };

        let bullish = e9 > e21 && e21 > e55;
        let bearish = e9 < e21 && e21 < e55;
        let bias = if bullish {
            Bias::Bullish
        } else if bearish {
            Bias::Bearish
        } else {
            Bias::Neutral
        };

        let separation = ema_separation_pct(e9, e55).unwrap_or(0.0);
        let price_above_e21 = inputs.current_price > e21;

        // Fully stacked EMAs score by separation; a mixed stack is weak.
        let confidence = if bias == Bias::Neutral {
            30.0
        } else {
            (55.0 + separation.abs() * 10.0).min(95.0)
        };

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "ema_9": e9,
                "ema_21": e21,
                "ema_55": e55,
                "separation_pct": separation,
                "price_above_ema_21": price_above_e21,
            }),
            model: None,
        })
    }
}

// =============================================================================
// Momentum — RSI + ROC
// =============================================================================

pub struct MomentumAnalyzer;

static MOMENTUM_SPEC: AnalyzerSpec = cheap_spec(MOMENTUM_ID);

#[async_trait]
impl Analyzer for MomentumAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &MOMENTUM_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let ind = &inputs.indicators;
        let rsi = ind
            .rsi_14
            .ok_or_else(|| anyhow::anyhow!("insufficient candles for RSI"))?;
        let roc = ind.roc_14.unwrap_or(0.0);

        let zone = if rsi >= 70.0 {
            "overbought"
        } else if rsi <= 30.0 {
            "oversold"
        } else {
            "neutral"
        };

        // RSI distance from 50 agrees or disagrees with ROC sign.
        let rsi_lean = rsi - 50.0;
        let aligned = rsi_lean.signum() == roc.signum() && roc.abs() > 0.05;
        let bias = if aligned && rsi_lean > 0.0 {
            Bias::Bullish
        } else if aligned && rsi_lean < 0.0 {
            Bias::Bearish
        } else {
            Bias::Neutral
        };

        let confidence = if bias == Bias::Neutral {
            35.0
        } else {
            (45.0 + rsi_lean.abs() + roc.abs().min(10.0) * 2.0).min(92.0)
        };

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "rsi_14": rsi,
                "roc_14": roc,
                "zone": zone,
            }),
            model: None,
        })
    }
}

// =============================================================================
// Volatility — ATR + Bollinger width regime
// =============================================================================

pub struct VolatilityAnalyzer;

static VOLATILITY_SPEC: AnalyzerSpec = cheap_spec(VOLATILITY_ID);

#[async_trait]
impl Analyzer for VolatilityAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &VOLATILITY_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let ind = &inputs.indicators;
        let atr_pct = ind
            .atr_pct
            .ok_or_else(|| anyhow::anyhow!("insufficient candles for ATR"))?;
        let bb_width = ind.bollinger_width.unwrap_or(0.0);

        let regime = if atr_pct < 0.5 && bb_width < 2.0 {
            "low"
        } else if atr_pct > 2.0 || bb_width > 6.0 {
            "high"
        } else {
            "normal"
        };
        let squeeze = bb_width > 0.0 && bb_width < 1.5;

        // Volatility reads are directionless; the payload carries no bias.
        Ok(AgentOutcome {
            confidence: 60.0,
            payload: json!({
                "atr_14": ind.atr_14,
                "atr_pct": atr_pct,
                "bollinger_width": bb_width,
                "bollinger_upper": ind.bollinger_upper,
                "bollinger_lower": ind.bollinger_lower,
                "regime": regime,
                "squeeze": squeeze,
            }),
            model: None,
        })
    }
}

// =============================================================================
// Trend strength — ADX
// =============================================================================

pub struct TrendStrengthAnalyzer;

static TREND_STRENGTH_SPEC: AnalyzerSpec = cheap_spec(TREND_STRENGTH_ID);

#[async_trait]
impl Analyzer for TrendStrengthAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &TREND_STRENGTH_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let ind = &inputs.indicators;
        let adx = ind
            .adx_14
            .ok_or_else(|| anyhow::anyhow!("insufficient candles for ADX"))?;

        let label = if adx > 25.0 {
            "trending"
        } else if adx < 20.0 {
            "ranging"
        } else {
            "transitional"
        };

        // Direction comes from the EMA stack when available; ADX itself is
        // directionless.
        let bias = match (ind.ema_9, ind.ema_21) {
            (Some(e9), Some(e21)) if adx > 25.0 && e9 > e21 => Bias::Bullish,
            (Some(e9), Some(e21)) if adx > 25.0 && e9 < e21 => Bias::Bearish,
            _ => Bias::Neutral,
        };

        Ok(AgentOutcome {
            confidence: (40.0 + adx).min(90.0),
            payload: json!({
                "bias": bias.to_string(),
                "adx_14": adx,
                "label": label,
            }),
            model: None,
        })
    }
}

// =============================================================================
// Support / resistance — swing pivots
// =============================================================================

pub struct SupportResistanceAnalyzer;

static SR_SPEC: AnalyzerSpec = cheap_spec(SUPPORT_RESISTANCE_ID);

#[async_trait]
impl Analyzer for SupportResistanceAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &SR_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let candles = inputs.candles.as_slice();
        if candles.len() < 10 {
            anyhow::bail!("insufficient candles for pivot detection");
        }

        let (supports, resistances) = swing_pivots(candles, 2);
        let price = inputs.current_price;

        let nearest_support = supports
            .iter()
            .filter(|&&s| s < price)
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let nearest_resistance = resistances
            .iter()
            .filter(|&&r| r > price)
            .cloned()
            .fold(f64::INFINITY, f64::min);

        let mut watch: Vec<f64> = Vec::new();
        if nearest_support.is_finite() {
            watch.push(nearest_support);
        }
        if nearest_resistance.is_finite() {
            watch.push(nearest_resistance);
        }

        Ok(AgentOutcome {
            confidence: 55.0,
            payload: json!({
                "supports": supports,
                "resistances": resistances,
                "nearest_support": nearest_support.is_finite().then_some(nearest_support),
                "nearest_resistance": nearest_resistance.is_finite().then_some(nearest_resistance),
                "watch_levels": watch,
            }),
            model: None,
        })
    }
}

/// Swing pivot highs/lows: a bar whose extreme tops/bottoms `wing` bars on
/// both sides. Returns up to the last five of each, oldest first.
fn swing_pivots(
    candles: &[crate::market_data::aggregator::Candle],
    wing: usize,
) -> (Vec<f64>, Vec<f64>) {
    let mut supports = Vec::new();
    let mut resistances = Vec::new();

    for i in wing..candles.len().saturating_sub(wing) {
        let low = candles[i].low;
        let high = candles[i].high;

        let is_low = (1..=wing)
            .all(|k| low <= candles[i - k].low && low <= candles[i + k].low);
        let is_high = (1..=wing)
            .all(|k| high >= candles[i - k].high && high >= candles[i + k].high);

        if is_low {
            supports.push(low);
        }
        if is_high {
            resistances.push(high);
        }
    }

    let keep = |mut v: Vec<f64>| {
        let skip = v.len().saturating_sub(5);
        v.drain(..skip);
        v
    };
    (keep(supports), keep(resistances))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::agent::AgentResult;
    use crate::indicators::compute_baseline;
    use crate::market_data::aggregator::Candle;
    use crate::types::Timeframe;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.8;
                Candle {
                    token: 1,
                    timeframe: Timeframe::M5,
                    start: i as i64 * 300_000,
                    end: (i as i64 + 1) * 300_000,
                    open: base - 0.3,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.3,
                    volume: 120.0,
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
    async fn rising_series_reads_bullish() {
        let inputs = inputs_from(rising_candles(120));
        let cancel = CancellationToken::new();

        let trend = TrendFollowingAnalyzer.run(&cancel, &inputs).await.unwrap();
        assert_eq!(trend.payload["bias"], "Bullish");
        assert!(trend.confidence > 50.0);

        let strength = TrendStrengthAnalyzer.run(&cancel, &inputs).await.unwrap();
        assert_eq!(strength.payload["label"], "trending");
        assert_eq!(strength.payload["bias"], "Bullish");
    }

    #[tokio::test]
    async fn short_series_errors_cleanly() {
        let inputs = inputs_from(rising_candles(5));
        let cancel = CancellationToken::new();
        assert!(TrendFollowingAnalyzer.run(&cancel, &inputs).await.is_err());
        assert!(MomentumAnalyzer.run(&cancel, &inputs).await.is_err());
        assert!(TrendStrengthAnalyzer.run(&cancel, &inputs).await.is_err());
    }

    #[tokio::test]
    async fn volatility_payload_is_directionless() {
        let inputs = inputs_from(rising_candles(120));
        let out = VolatilityAnalyzer
            .run(&CancellationToken::new(), &inputs)
            .await
            .unwrap();
        assert!(out.payload.get("bias").is_none());
        assert!(out.payload["atr_pct"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn support_resistance_brackets_price() {
        // A wave pattern leaves clear pivots on both sides.
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 8.0;
                Candle {
                    token: 1,
                    timeframe: Timeframe::M5,
                    start: i as i64 * 300_000,
                    end: (i as i64 + 1) * 300_000,
                    open: base,
                    high: base + 1.2,
                    low: base - 1.2,
                    close: base,
                    volume: 100.0,
                }
            })
            .collect();
        let inputs = inputs_from(candles);
        let out = SupportResistanceAnalyzer
            .run(&CancellationToken::new(), &inputs)
            .await
            .unwrap();

        let supports = out.payload["supports"].as_array().unwrap();
        let resistances = out.payload["resistances"].as_array().unwrap();
        assert!(!supports.is_empty());
        assert!(!resistances.is_empty());
    }
}
