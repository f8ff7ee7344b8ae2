// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Streaming form: gains and losses run through separate Wilder averages,
// and the index is read as the gain share of total movement,
//
//   RSI = 100 * avg_gain / (avg_gain + avg_loss)
//
// which is the classic 100 - 100 / (1 + RS) without the divide-by-zero
// special cases: an all-gain series pins at 100, an all-loss series at 0,
// and a motionless market reads 50 by definition.
// =============================================================================

use crate::indicators::smoothing::WilderAverage;

/// Incremental RSI over a close series. Needs `period + 1` closes before
/// reporting (the first close only anchors the delta).
pub struct Rsi {
    prev_close: Option<f64>,
    gains: WilderAverage,
    losses: WilderAverage,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            prev_close: None,
            gains: WilderAverage::new(period),
            losses: WilderAverage::new(period),
        }
    }

    pub fn update(&mut self, close: f64) {
        if let Some(prev) = self.prev_close {
            // A non-finite close makes the delta non-finite, which poisons
            // both accumulators.
            let delta = close - prev;
            self.gains.push(delta.max(0.0));
            self.losses.push((-delta).max(0.0));
        }
        self.prev_close = Some(close);
    }

    pub fn value(&self) -> Option<f64> {
        let gain = self.gains.value()?;
        let loss = self.losses.value()?;

        let movement = gain + loss;
        if movement <= 0.0 {
            return Some(50.0);
        }
        let rsi = 100.0 * gain / movement;
        rsi.is_finite().then_some(rsi)
    }
}
