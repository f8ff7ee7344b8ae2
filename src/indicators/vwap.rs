// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
//   VWAP = sum(typical_price * volume) / sum(volume)
//   typical_price = (high + low + close) / 3
// =============================================================================

use crate::market_data::aggregator::Candle;

/// VWAP over the whole slice. `None` on empty input or zero total volume.
pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv_sum += typical * c.volume;
        vol_sum += c.volume;
    }

    if vol_sum <= 0.0 {
        return None;
    }
    let vwap = pv_sum / vol_sum;
    vwap.is_finite().then_some(vwap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn candle(high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            token: 1,
            timeframe: Timeframe::M5,
            start: 0,
            end: 300_000,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn empty_is_none() {
        assert!(calculate_vwap(&[]).is_none());
    }

    #[test]
    fn zero_volume_is_none() {
        let candles = vec![candle(101.0, 99.0, 100.0, 0.0)];
        assert!(calculate_vwap(&candles).is_none());
    }

    #[test]
    fn single_candle_is_typical_price() {
        let candles = vec![candle(102.0, 98.0, 100.0, 10.0)];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 100.0).abs() < 1e-10);
    }

    #[test]
    fn heavier_volume_pulls_vwap() {
        let candles = vec![
            candle(101.0, 99.0, 100.0, 1.0),
            candle(111.0, 109.0, 110.0, 9.0),
        ];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!(vwap > 105.0, "vwap should sit near the heavy bar, got {vwap}");
    }
}
