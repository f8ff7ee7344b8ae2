// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Streaming form: the accumulator seeds with the SMA of its first `period`
// closes, then blends every later close in with weight 2 / (period + 1).
// The baseline fold feeds one close at a time; only the latest value is
// ever needed.
// =============================================================================

/// Incremental EMA over a close series.
pub struct Ema {
    period: usize,
    weight: f64,
    seed_sum: f64,
    seed_count: usize,
    current: Option<f64>,
    poisoned: bool,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            weight: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            seed_count: 0,
            current: None,
            poisoned: period == 0,
        }
    }

    pub fn update(&mut self, close: f64) {
        if self.poisoned {
            return;
        }
        if !close.is_finite() {
            self.poisoned = true;
            return;
        }

        self.current = match self.current {
            None => {
                self.seed_sum += close;
                self.seed_count += 1;
                (self.seed_count == self.period).then(|| self.seed_sum / self.period as f64)
            }
            Some(prev) => Some(prev + self.weight * (close - prev)),
        };

        if let Some(v) = self.current {
            if !v.is_finite() {
                self.poisoned = true;
            }
        }
    }

    /// The latest EMA, once the warm-up window is full and the series is
    /// unbroken.
    pub fn value(&self) -> Option<f64> {
        if self.poisoned {
            None
        } else {
            self.current
        }
    }
}

/// Percent separation between two EMA values, relative to the slower one.
/// `None` when the slower EMA is zero or the result is non-finite.
pub fn ema_separation_pct(fast: f64, slow: f64) -> Option<f64> {
    if slow.abs() <= f64::EPSILON {
        return None;
    }
    let sep = (fast - slow) / slow * 100.0;
    sep.is_finite().then_some(sep)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ema: &mut Ema, closes: impl IntoIterator<Item = f64>) {
        for close in closes {
            ema.update(close);
        }
    }

    #[test]
    fn silent_until_warmup_completes() {
        let mut ema = Ema::new(3);
        ema.update(2.0);
        ema.update(4.0);
        assert_eq!(ema.value(), None);
        ema.update(6.0);
        assert_eq!(ema.value(), Some(4.0)); // SMA seed
    }

    #[test]
    fn zero_period_never_yields() {
        let mut ema = Ema::new(0);
        feed(&mut ema, [1.0, 2.0, 3.0]);
        assert_eq!(ema.value(), None);
    }

    #[test]
    fn blend_tracks_hand_computed_values() {
        // Period 5 over 1..=10: seed 3.0, then each close pulls the value
        // toward itself with weight 1/3.
        let mut ema = Ema::new(5);
        let mut expected = None;
        for close in 1..=10 {
            let close = close as f64;
            ema.update(close);
            expected = match expected {
                None if close == 5.0 => Some(3.0),
                None => None,
                Some(prev) => Some(prev + (close - prev) / 3.0),
            };
            assert_eq!(ema.value(), expected, "after close {close}");
        }
    }

    #[test]
    fn nan_poisons_permanently() {
        let mut ema = Ema::new(2);
        feed(&mut ema, [1.0, 2.0]);
        assert!(ema.value().is_some());
        ema.update(f64::NAN);
        assert_eq!(ema.value(), None);
        ema.update(10.0);
        assert_eq!(ema.value(), None);
    }

    #[test]
    fn lags_a_rising_series() {
        let mut ema = Ema::new(9);
        feed(&mut ema, (1..=50).map(|x| x as f64));
        let value = ema.value().unwrap();
        assert!(value < 50.0);
        assert!(value > 40.0);
    }

    #[test]
    fn separation_pct() {
        assert_eq!(ema_separation_pct(102.0, 100.0), Some(2.0));
        assert_eq!(ema_separation_pct(98.0, 100.0), Some(-2.0));
        assert_eq!(ema_separation_pct(1.0, 0.0), None);
    }
}
