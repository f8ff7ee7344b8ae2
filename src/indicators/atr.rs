// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// Streaming form: each bar's true range runs through a Wilder average.
//
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// Needs `period + 1` candles before reporting: the first bar only anchors
// the previous close for the gap terms.
// =============================================================================

use crate::indicators::smoothing::WilderAverage;
use crate::market_data::aggregator::Candle;

/// True range of one bar against the prior close. Shared with the ADX
/// directional pipeline.
pub(crate) fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    (candle.high - candle.low)
        .max((candle.high - prev_close).abs())
        .max((candle.low - prev_close).abs())
}

/// Incremental ATR over a candle series.
pub struct Atr {
    prev_close: Option<f64>,
    ranges: WilderAverage,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            prev_close: None,
            ranges: WilderAverage::new(period),
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        if let Some(prev) = self.prev_close {
            // Non-finite OHLC makes the range non-finite, which poisons
            // the accumulator.
            self.ranges.push(true_range(candle, prev));
        }
        self.prev_close = Some(candle.close);
    }

    pub fn value(&self) -> Option<f64> {
        self.ranges.value()
    }

    /// ATR as a percentage of `price`; comparable across price scales.
    pub fn pct_of(&self, price: f64) -> Option<f64> {
        if price == 0.0 {
            return None;
        }
        Some(self.value()? / price * 100.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            token: 1,
            timeframe: Timeframe::M5,
            start: 0,
            end: 300_000,
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    fn atr_over(candles: &[Candle], period: usize) -> Option<f64> {
        let mut atr = Atr::new(period);
        for c in candles {
            atr.update(c);
        }
        atr.value()
    }

    #[test]
    fn needs_period_plus_one_candles() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 20];
        assert_eq!(atr_over(&candles[..3], 3), None);
        assert!(atr_over(&candles[..4], 3).is_some());
        assert_eq!(atr_over(&candles, 0), None);
    }

    #[test]
    fn constant_range_converges_to_that_range() {
        let mut atr = Atr::new(14);
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            atr.update(&candle(base, base + 5.0, base - 5.0, base));
        }
        let value = atr.value().unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected near 10.0, got {value}");
    }

    #[test]
    fn gap_enters_through_prev_close() {
        // The gap-up bar's own span is 7, but against the prior close the
        // true range is 20.
        let bars = [
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0),
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        assert_eq!(true_range(&bars[1], bars[0].close), 20.0);
        let value = atr_over(&bars, 3).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }

    #[test]
    fn pct_of_scales_by_price() {
        let mut atr = Atr::new(3);
        for i in 0..6 {
            let base = 100.0 + i as f64;
            atr.update(&candle(base, base + 2.0, base - 2.0, base));
        }
        let value = atr.value().unwrap();
        let pct = atr.pct_of(200.0).unwrap();
        assert!((pct - value / 2.0).abs() < 1e-9);
        assert_eq!(atr.pct_of(0.0), None);
    }

    #[test]
    fn nan_bar_poisons() {
        let mut atr = Atr::new(2);
        atr.update(&candle(100.0, 105.0, 95.0, 100.0));
        atr.update(&candle(100.0, f64::NAN, 95.0, 100.0));
        atr.update(&candle(100.0, 105.0, 95.0, 100.0));
        atr.update(&candle(100.0, 105.0, 95.0, 100.0));
        assert_eq!(atr.value(), None);
    }
}
