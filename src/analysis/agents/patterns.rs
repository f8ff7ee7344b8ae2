// =============================================================================
// Pattern Analyzers — chart geometry and candlestick formations
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

pub const CHART_PATTERNS_ID: &str = "chart_patterns";
pub const CANDLESTICK_ID: &str = "candlestick_patterns";

const fn pattern_spec(id: &'static str) -> AnalyzerSpec {
    AnalyzerSpec {
        id,
        required_inputs: RequiredInputs {
            candles: true,
            indicators: false,
            patterns: true,
            chart_image: false,
            prior_results: &[],
        },
        timeout_ms: 8_000,
        cost_class: CostClass::Standard,
        model_preference: ModelTier::Auto,
    }
}

// =============================================================================
// Chart patterns
// =============================================================================

pub struct ChartPatternAnalyzer;

static CHART_SPEC: AnalyzerSpec = pattern_spec(CHART_PATTERNS_ID);

#[derive(Debug)]
struct DetectedPattern {
    name: &'static str,
    direction: Bias,
    confidence: f64,
    /// Raw geometry: index/price points the detection anchored on. The
    /// context builder drops this block first under budget pressure.
    geometry: serde_json::Value,
}

#[async_trait]
impl Analyzer for ChartPatternAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &CHART_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let candles = inputs.candles.as_slice();
        if candles.len() < 30 {
            anyhow::bail!("insufficient candles for chart patterns");
        }

        let mut patterns: Vec<DetectedPattern> = Vec::new();
        if let Some(p) = detect_structure_trend(candles) {
            patterns.push(p);
        }
        if let Some(p) = detect_double_extreme(candles) {
            patterns.push(p);
        }
        if let Some(p) = detect_range_compression(candles) {
            patterns.push(p);
        }

        let bias = dominant_direction(&patterns);
        let confidence = patterns
            .iter()
            .map(|p| p.confidence)
            .fold(0.0_f64, f64::max)
            .max(30.0);

        let payload_patterns: Vec<serde_json::Value> = patterns
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "direction": p.direction.to_string(),
                    "confidence": p.confidence,
                    "geometry": p.geometry,
                })
            })
            .collect();

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "patterns": payload_patterns,
                "pattern_count": patterns.len(),
            }),
            model: None,
        })
    }
}

/// Higher-highs/higher-lows (or the inverse) over the last three swing
/// segments.
fn detect_structure_trend(candles: &[Candle]) -> Option<DetectedPattern> {
    let n = candles.len();
    let thirds = [&candles[n - 30..n - 20], &candles[n - 20..n - 10], &candles[n - 10..]];

    let highs: Vec<f64> = thirds
        .iter()
        .map(|seg| seg.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max))
        .collect();
    let lows: Vec<f64> = thirds
        .iter()
        .map(|seg| seg.iter().map(|c| c.low).fold(f64::INFINITY, f64::min))
        .collect();

    let ascending = highs.windows(2).all(|w| w[1] > w[0]) && lows.windows(2).all(|w| w[1] > w[0]);
    let descending = highs.windows(2).all(|w| w[1] < w[0]) && lows.windows(2).all(|w| w[1] < w[0]);

    if !ascending && !descending {
        return None;
    }

    Some(DetectedPattern {
        name: if ascending {
            "ascending_structure"
        } else {
            "descending_structure"
        },
        direction: if ascending { Bias::Bullish } else { Bias::Bearish },
        confidence: 68.0,
        geometry: json!({ "segment_highs": highs, "segment_lows": lows }),
    })
}

/// Two swing highs (or lows) within 0.5% of each other: double top/bottom.
fn detect_double_extreme(candles: &[Candle]) -> Option<DetectedPattern> {
    let window = &candles[candles.len().saturating_sub(40)..];
    let mut swing_highs: Vec<(usize, f64)> = Vec::new();
    let mut swing_lows: Vec<(usize, f64)> = Vec::new();

    for i in 2..window.len().saturating_sub(2) {
        let h = window[i].high;
        let l = window[i].low;
        if (1..=2).all(|k| h >= window[i - k].high && h >= window[i + k].high) {
            swing_highs.push((i, h));
        }
        if (1..=2).all(|k| l <= window[i - k].low && l <= window[i + k].low) {
            swing_lows.push((i, l));
        }
    }

    let near = |a: f64, b: f64| (a - b).abs() / a.max(b) < 0.005;

    if let Some((a, b)) = last_pair(&swing_highs) {
        if near(a.1, b.1) {
            return Some(DetectedPattern {
                name: "double_top",
                direction: Bias::Bearish,
                confidence: 62.0,
                geometry: json!({ "first": {"index": a.0, "price": a.1},
                                  "second": {"index": b.0, "price": b.1} }),
            });
        }
    }
    if let Some((a, b)) = last_pair(&swing_lows) {
        if near(a.1, b.1) {
            return Some(DetectedPattern {
                name: "double_bottom",
                direction: Bias::Bullish,
                confidence: 62.0,
                geometry: json!({ "first": {"index": a.0, "price": a.1},
                                  "second": {"index": b.0, "price": b.1} }),
            });
        }
    }
    None
}

/// Contracting high-low range over the last 20 bars (triangle / coil).
fn detect_range_compression(candles: &[Candle]) -> Option<DetectedPattern> {
    let n = candles.len();
    let early = &candles[n - 20..n - 10];
    let late = &candles[n - 10..];

    let range = |seg: &[Candle]| {
        let hi = seg.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let lo = seg.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        hi - lo
    };

    let early_range = range(early);
    let late_range = range(late);
    if early_range <= 0.0 || late_range >= early_range * 0.6 {
        return None;
    }

    Some(DetectedPattern {
        name: "range_compression",
        direction: Bias::Neutral,
        confidence: 55.0,
        geometry: json!({ "early_range": early_range, "late_range": late_range }),
    })
}

fn last_pair<T: Copy>(v: &[T]) -> Option<(T, T)> {
    if v.len() < 2 {
        return None;
    }
    Some((v[v.len() - 2], v[v.len() - 1]))
}

fn dominant_direction(patterns: &[DetectedPattern]) -> Bias {
    let mut score = 0.0;
    for p in patterns {
        match p.direction {
            Bias::Bullish => score += p.confidence,
            Bias::Bearish => score -= p.confidence,
            Bias::Neutral => {}
        }
    }
    if score > 10.0 {
        Bias::Bullish
    } else if score < -10.0 {
        Bias::Bearish
    } else {
        Bias::Neutral
    }
}

// =============================================================================
// Candlestick patterns
// =============================================================================

pub struct CandlestickAnalyzer;

static CANDLESTICK_SPEC: AnalyzerSpec = pattern_spec(CANDLESTICK_ID);

#[async_trait]
impl Analyzer for CandlestickAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &CANDLESTICK_SPEC
    }

    async fn run(
        &self,
        _cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let candles = inputs.candles.as_slice();
        if candles.len() < 3 {
            anyhow::bail!("insufficient candles for candlestick patterns");
        }

        let mut signals: Vec<(&'static str, Bias)> = Vec::new();
        let last = &candles[candles.len() - 1];
        let prev = &candles[candles.len() - 2];

        // Engulfing: current body swallows the previous body, opposite color.
        let body = |c: &Candle| (c.close - c.open).abs();
        if body(last) > body(prev) * 1.1 {
            if last.close > last.open && prev.close < prev.open && last.close > prev.open {
                signals.push(("bullish_engulfing", Bias::Bullish));
            } else if last.close < last.open && prev.close > prev.open && last.close < prev.open {
                signals.push(("bearish_engulfing", Bias::Bearish));
            }
        }

        let range = last.high - last.low;
        if range > 0.0 {
            let body_frac = body(last) / range;
            let lower_wick = last.open.min(last.close) - last.low;
            let upper_wick = last.high - last.open.max(last.close);

            if body_frac < 0.1 {
                signals.push(("doji", Bias::Neutral));
            } else if lower_wick > body(last) * 2.0 && upper_wick < body(last) * 0.5 {
                signals.push(("hammer", Bias::Bullish));
            } else if upper_wick > body(last) * 2.0 && lower_wick < body(last) * 0.5 {
                signals.push(("shooting_star", Bias::Bearish));
            }
        }

        let bias = {
            let bull = signals.iter().filter(|(_, b)| *b == Bias::Bullish).count();
            let bear = signals.iter().filter(|(_, b)| *b == Bias::Bearish).count();
            if bull > bear {
                Bias::Bullish
            } else if bear > bull {
                Bias::Bearish
            } else {
                Bias::Neutral
            }
        };

        let confidence = if signals.is_empty() { 30.0 } else { 58.0 };

        Ok(AgentOutcome {
            confidence,
            payload: json!({
                "bias": bias.to_string(),
                "signals": signals.iter().map(|(name, dir)| json!({
                    "name": name,
                    "direction": dir.to_string(),
                })).collect::<Vec<_>>(),
            }),
            model: None,
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
    use crate::types::Timeframe;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn candle(open: f64, high: f64, low: f64, close: f64, i: i64) -> Candle {
        Candle {
            token: 1,
            timeframe: Timeframe::M5,
            start: i * 300_000,
            end: (i + 1) * 300_000,
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    fn inputs_from(candles: Vec<Candle>) -> AnalysisInputs {
        let price = candles.last().map(|c| c.close).unwrap_or(0.0);
        AnalysisInputs {
            symbol: "ACME".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M5,
            current_price: price,
            candles: Arc::new(candles),
            indicators: Arc::new(IndicatorSnapshot::default()),
            tick_size: None,
            prior: Arc::new(HashMap::<String, AgentResult>::new()),
        }
    }

    #[tokio::test]
    async fn ascending_structure_detected() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 1.0;
                candle(base, base + 1.0, base - 1.0, base + 0.5, i as i64)
            })
            .collect();
        let out = ChartPatternAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles))
            .await
            .unwrap();
        assert_eq!(out.payload["bias"], "Bullish");
        let names: Vec<String> = out.payload["patterns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"ascending_structure".to_string()));
    }

    #[tokio::test]
    async fn geometry_present_in_payload() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 1.0, base - 1.0, base + 0.5, i as i64)
            })
            .collect();
        let out = ChartPatternAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles))
            .await
            .unwrap();
        let patterns = out.payload["patterns"].as_array().unwrap();
        assert!(patterns.iter().all(|p| p.get("geometry").is_some()));
    }

    #[tokio::test]
    async fn bullish_engulfing_detected() {
        let mut candles: Vec<Candle> = (0..10)
            .map(|i| candle(100.0, 101.0, 99.0, 100.2, i as i64))
            .collect();
        // Red candle then a larger green body engulfing it.
        candles.push(candle(100.5, 100.8, 99.4, 99.6, 10));
        candles.push(candle(99.5, 101.8, 99.3, 101.5, 11));

        let out = CandlestickAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles))
            .await
            .unwrap();
        let names: Vec<String> = out.payload["signals"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"bullish_engulfing".to_string()));
        assert_eq!(out.payload["bias"], "Bullish");
    }

    #[tokio::test]
    async fn doji_detected() {
        let mut candles: Vec<Candle> = (0..5)
            .map(|i| candle(100.0, 101.0, 99.0, 100.5, i as i64))
            .collect();
        candles.push(candle(100.0, 101.0, 99.0, 100.02, 5));

        let out = CandlestickAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles))
            .await
            .unwrap();
        let names: Vec<String> = out.payload["signals"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"doji".to_string()));
    }

    #[tokio::test]
    async fn quiet_tape_yields_neutral_low_confidence() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| candle(100.0, 100.6, 99.8, 100.4, i as i64))
            .collect();
        let out = CandlestickAnalyzer
            .run(&CancellationToken::new(), &inputs_from(candles))
            .await
            .unwrap();
        assert_eq!(out.payload["bias"], "Neutral");
        assert!(out.confidence <= 35.0);
    }
}
