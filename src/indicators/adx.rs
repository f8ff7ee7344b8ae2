// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// Trend strength regardless of direction, as a two-stage streaming
// pipeline:
//
//   stage 1: +DM, -DM, and true range run through Wilder sums, giving the
//            directional indices +DI / -DI;
//   stage 2: DX = 100 * |+DI - -DI| / (+DI + -DI) runs through a Wilder
//            average.
//
// First value after `2 * period` candles: one bar anchors the deltas,
// `period` deltas seed the sums (the first DX sample arrives with that
// seed), and `period` DX samples seed the average. ADX > 25 reads as
// trending, < 20 as ranging.
// =============================================================================

use crate::indicators::atr::true_range;
use crate::indicators::smoothing::{WilderAverage, WilderSum};
use crate::market_data::aggregator::Candle;

/// Incremental ADX over a candle series.
pub struct Adx {
    prev_bar: Option<(f64, f64, f64)>, // (high, low, close)
    plus_dm: WilderSum,
    minus_dm: WilderSum,
    ranges: WilderSum,
    dx: WilderAverage,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        Self {
            prev_bar: None,
            plus_dm: WilderSum::new(period),
            minus_dm: WilderSum::new(period),
            ranges: WilderSum::new(period),
            dx: WilderAverage::new(period),
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        if let Some((prev_high, prev_low, prev_close)) = self.prev_bar {
            let up_move = candle.high - prev_high;
            let down_move = prev_low - candle.low;

            // Only the dominant, positive move counts as directional
            // movement; ties count for neither side.
            self.plus_dm
                .push(if up_move > down_move && up_move > 0.0 {
                    up_move
                } else {
                    0.0
                });
            self.minus_dm
                .push(if down_move > up_move && down_move > 0.0 {
                    down_move
                } else {
                    0.0
                });
            self.ranges.push(true_range(candle, prev_close));

            // A broken stage one must take stage two down with it; the
            // average would otherwise keep reporting its stale value.
            if self.stage_one_poisoned() {
                self.dx.poison();
            } else if let Some(dx) = self.directional_index() {
                self.dx.push(dx);
            }
        }
        self.prev_bar = Some((candle.high, candle.low, candle.close));
    }

    fn stage_one_poisoned(&self) -> bool {
        self.plus_dm.is_poisoned() || self.minus_dm.is_poisoned() || self.ranges.is_poisoned()
    }

    /// DX from the current smoothed sums; `None` while stage one warms up.
    /// A flat tape (zero range or zero directional movement) reads 0.
    fn directional_index(&self) -> Option<f64> {
        let range_sum = self.ranges.value()?;
        let plus = self.plus_dm.value()?;
        let minus = self.minus_dm.value()?;

        if range_sum <= 0.0 {
            return Some(0.0);
        }
        let plus_di = 100.0 * plus / range_sum;
        let minus_di = 100.0 * minus / range_sum;

        let spread = plus_di + minus_di;
        if spread == 0.0 {
            return Some(0.0);
        }
        let dx = 100.0 * (plus_di - minus_di).abs() / spread;
        dx.is_finite().then_some(dx)
    }

    pub fn value(&self) -> Option<f64> {
        self.dx.value()
    }
}
