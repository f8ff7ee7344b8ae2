// =============================================================================
// Technical Indicators
// =============================================================================
//
// The Wilder family (RSI, ATR, ADX) and the EMAs are incremental state
// machines built on the shared smoothing primitives, so `compute_baseline`
// folds the candle series once, bar by bar — the same shape as the live
// tick path. Bollinger, ROC, and VWAP read the finished series directly.
// Every indicator reports `Option`/empty on insufficient data so callers
// are forced to handle the warm-up window.
//
// `compute_baseline` assembles the snapshot the analyzers and the
// prior-levels derivation consume; its field names are part of the
// persisted `signals` shape.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod roc;
pub mod rsi;
pub mod smoothing;
pub mod vwap;

use serde::Serialize;

use crate::market_data::aggregator::Candle;

/// Baseline indicator values for one candle series. `None` fields mean the
/// series was too short for that indicator's warm-up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndicatorSnapshot {
    pub current_price: f64,
    pub ema_9: Option<f64>,
    pub ema_21: Option<f64>,
    pub ema_55: Option<f64>,
    pub rsi_14: Option<f64>,
    pub atr_14: Option<f64>,
    pub atr_pct: Option<f64>,
    pub adx_14: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_middle: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub bollinger_width: Option<f64>,
    pub roc_14: Option<f64>,
    pub vwap: Option<f64>,
    pub volume_sma_20: Option<f64>,
    /// Ratio of the latest bar's volume to its 20-bar average.
    pub volume_ratio: Option<f64>,
    pub candle_count: usize,
}

/// Compute the full baseline snapshot from a closed-candle series (oldest
/// first).
pub fn compute_baseline(candles: &[Candle]) -> IndicatorSnapshot {
    // One pass feeds every streaming indicator.
    let mut ema_9 = ema::Ema::new(9);
    let mut ema_21 = ema::Ema::new(21);
    let mut ema_55 = ema::Ema::new(55);
    let mut rsi_14 = rsi::Rsi::new(14);
    let mut atr_14 = atr::Atr::new(14);
    let mut adx_14 = adx::Adx::new(14);

    for c in candles {
        ema_9.update(c.close);
        ema_21.update(c.close);
        ema_55.update(c.close);
        rsi_14.update(c.close);
        atr_14.update(c);
        adx_14.update(c);
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let current_price = closes.last().copied().unwrap_or(0.0);

    let bb = bollinger::calculate_bollinger(&closes, 20, 2.0);

    let volume_sma_20 = if candles.len() >= 20 {
        let sum: f64 = candles[candles.len() - 20..].iter().map(|c| c.volume).sum();
        Some(sum / 20.0)
    } else {
        None
    };
    let volume_ratio = match (volume_sma_20, candles.last()) {
        (Some(sma), Some(last)) if sma > 0.0 => Some(last.volume / sma),
        _ => None,
    };

    IndicatorSnapshot {
        current_price,
        ema_9: ema_9.value(),
        ema_21: ema_21.value(),
        ema_55: ema_55.value(),
        rsi_14: rsi_14.value(),
        atr_14: atr_14.value(),
        atr_pct: atr_14.pct_of(current_price),
        adx_14: adx_14.value(),
        bollinger_upper: bb.as_ref().map(|b| b.upper),
        bollinger_middle: bb.as_ref().map(|b| b.middle),
        bollinger_lower: bb.as_ref().map(|b| b.lower),
        bollinger_width: bb.as_ref().map(|b| b.width),
        roc_14: roc::current_roc(&closes, 14),
        vwap: vwap::calculate_vwap(candles),
        volume_sma_20,
        volume_ratio,
        candle_count: candles.len(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.37).sin() * 4.0 + i as f64 * 0.05;
                Candle {
                    token: 1,
                    timeframe: Timeframe::M5,
                    start: i as i64 * 300_000,
                    end: (i as i64 + 1) * 300_000,
                    open: base - 0.2,
                    high: base + 1.5,
                    low: base - 1.5,
                    close: base + 0.3,
                    volume: 100.0 + (i % 7) as f64 * 10.0,
                }
            })
            .collect()
    }

    #[test]
    fn baseline_full_series_populates_everything() {
        let snap = compute_baseline(&series(120));
        assert!(snap.current_price > 0.0);
        assert!(snap.ema_9.is_some());
        assert!(snap.ema_55.is_some());
        assert!(snap.rsi_14.is_some());
        assert!(snap.atr_14.is_some());
        assert!(snap.adx_14.is_some());
        assert!(snap.bollinger_width.is_some());
        assert!(snap.roc_14.is_some());
        assert!(snap.vwap.is_some());
        assert!(snap.volume_ratio.is_some());
        assert_eq!(snap.candle_count, 120);
    }

    #[test]
    fn baseline_short_series_leaves_gaps() {
        let snap = compute_baseline(&series(10));
        assert!(snap.ema_9.is_some());
        assert!(snap.ema_55.is_none());
        assert!(snap.rsi_14.is_none());
        assert!(snap.adx_14.is_none());
        assert!(snap.volume_sma_20.is_none());
        assert!(snap.vwap.is_some());
        assert_eq!(snap.candle_count, 10);
    }

    #[test]
    fn baseline_empty_series() {
        let snap = compute_baseline(&[]);
        assert_eq!(snap.current_price, 0.0);
        assert!(snap.ema_9.is_none());
        assert!(snap.atr_pct.is_none());
        assert_eq!(snap.candle_count, 0);
    }

    #[test]
    fn atr_pct_consistent_with_atr_and_price() {
        let snap = compute_baseline(&series(120));
        let expected = snap.atr_14.unwrap() / snap.current_price * 100.0;
        assert!((snap.atr_pct.unwrap() - expected).abs() < 1e-9);
    }
}
