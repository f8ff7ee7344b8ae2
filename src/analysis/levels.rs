// =============================================================================
// Prior Trading Levels — deterministic ATR-based derivation
// =============================================================================
//
// Derived from the indicator stage, never from the language model. These
// levels are the consistency anchor for the final decision: the synthesizer
// may move at most one endpoint per horizon by <=2% (with a rationale), or
// the prior levels are forced back in.
//
// Per horizon with the declared constants (k, m, n):
//   entry_range = [current - k*ATR, current + k*ATR]
//   bullish: stop = entry.lo - m*ATR, targets = entry.hi + n_i*ATR
//   bearish: stop = entry.hi + m*ATR, targets = entry.lo - n_i*ATR
// A neutral horizon takes the bullish orientation.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Bias, Horizon};

// =============================================================================
// Horizon parameters
// =============================================================================

/// ATR multipliers for one horizon.
#[derive(Debug, Clone, Copy)]
pub struct HorizonParams {
    pub k: f64,
    pub m: f64,
    pub n: [f64; 2],
}

pub const SHORT_TERM_PARAMS: HorizonParams = HorizonParams {
    k: 0.25,
    m: 1.0,
    n: [1.5, 2.5],
};
pub const MEDIUM_TERM_PARAMS: HorizonParams = HorizonParams {
    k: 0.5,
    m: 2.0,
    n: [3.0, 5.0],
};
pub const LONG_TERM_PARAMS: HorizonParams = HorizonParams {
    k: 1.0,
    m: 3.5,
    n: [5.0, 8.0],
};

pub fn params_for(horizon: Horizon) -> HorizonParams {
    match horizon {
        Horizon::ShortTerm => SHORT_TERM_PARAMS,
        Horizon::MediumTerm => MEDIUM_TERM_PARAMS,
        Horizon::LongTerm => LONG_TERM_PARAMS,
    }
}

// =============================================================================
// Level types
// =============================================================================

/// Entry/stop/target levels for one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSet {
    pub entry_range: [f64; 2],
    pub stop_loss: f64,
    /// Ordered: ascending for bullish, descending for bearish.
    pub targets: Vec<f64>,
}

/// Levels plus the bias they were derived under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonLevels {
    pub bias: Bias,
    #[serde(flatten)]
    pub levels: LevelSet,
}

/// The full anchor block for a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorTradingLevels {
    pub short_term: HorizonLevels,
    pub medium_term: HorizonLevels,
    pub long_term: HorizonLevels,
}

impl PriorTradingLevels {
    pub fn horizon(&self, horizon: Horizon) -> &HorizonLevels {
        match horizon {
            Horizon::ShortTerm => &self.short_term,
            Horizon::MediumTerm => &self.medium_term,
            Horizon::LongTerm => &self.long_term,
        }
    }
}

// =============================================================================
// Derivation
// =============================================================================

/// Round to the instrument tick size when known, else to 4 decimals.
pub fn round_price(value: f64, tick_size: Option<f64>) -> f64 {
    match tick_size {
        Some(tick) if tick > 0.0 => (value / tick).round() * tick,
        _ => (value * 10_000.0).round() / 10_000.0,
    }
}

/// Derive the levels for a single horizon.
pub fn derive_horizon(
    current_price: f64,
    atr: f64,
    bias: Bias,
    horizon: Horizon,
    tick_size: Option<f64>,
) -> HorizonLevels {
    let p = params_for(horizon);
    let r = |v: f64| round_price(v, tick_size);

    let entry_lo = r(current_price - p.k * atr);
    let entry_hi = r(current_price + p.k * atr);

    let levels = match bias {
        Bias::Bearish => LevelSet {
            entry_range: [entry_lo, entry_hi],
            stop_loss: r(entry_hi + p.m * atr),
            targets: p.n.iter().map(|&n| r(entry_lo - n * atr)).collect(),
        },
        // Neutral orients like bullish.
        Bias::Bullish | Bias::Neutral => LevelSet {
            entry_range: [entry_lo, entry_hi],
            stop_loss: r(entry_lo - p.m * atr),
            targets: p.n.iter().map(|&n| r(entry_hi + n * atr)).collect(),
        },
    };

    HorizonLevels { bias, levels }
}

/// Derive the full anchor from the indicator-stage output.
pub fn derive_prior_levels(
    current_price: f64,
    atr: f64,
    biases: [Bias; 3],
    tick_size: Option<f64>,
) -> PriorTradingLevels {
    PriorTradingLevels {
        short_term: derive_horizon(current_price, atr, biases[0], Horizon::ShortTerm, tick_size),
        medium_term: derive_horizon(current_price, atr, biases[1], Horizon::MediumTerm, tick_size),
        long_term: derive_horizon(current_price, atr, biases[2], Horizon::LongTerm, tick_size),
    }
}

// =============================================================================
// Ordering validation
// =============================================================================

/// Check the inequality chain for a horizon's levels:
/// bullish: stop < entry.lo <= entry.hi < t0 < t1 < ...
/// bearish: stop > entry.hi >= entry.lo > t0 > t1 > ...
pub fn validate_chain(bias: Bias, levels: &LevelSet) -> Result<(), String> {
    let [lo, hi] = levels.entry_range;
    if levels.targets.is_empty() {
        return Err("no targets".to_string());
    }
    if lo > hi {
        return Err(format!("entry range inverted: [{lo}, {hi}]"));
    }

    match bias {
        Bias::Bullish | Bias::Neutral => {
            if levels.stop_loss >= lo {
                return Err(format!(
                    "stop {} not below entry low {lo}",
                    levels.stop_loss
                ));
            }
            let mut prev = hi;
            for &t in &levels.targets {
                if t <= prev {
                    return Err(format!("target {t} not above {prev}"));
                }
                prev = t;
            }
        }
        Bias::Bearish => {
            if levels.stop_loss <= hi {
                return Err(format!(
                    "stop {} not above entry high {hi}",
                    levels.stop_loss
                ));
            }
            let mut prev = lo;
            for &t in &levels.targets {
                if t >= prev {
                    return Err(format!("target {t} not below {prev}"));
                }
                prev = t;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullish_short_horizon_chain() {
        // current 100, ATR 2: entry [99.5, 100.5], stop 97.5,
        // targets [103.5, 105.5].
        let h = derive_horizon(100.0, 2.0, Bias::Bullish, Horizon::ShortTerm, None);
        assert_eq!(h.levels.entry_range, [99.5, 100.5]);
        assert_eq!(h.levels.stop_loss, 97.5);
        assert_eq!(h.levels.targets, vec![103.5, 105.5]);
        validate_chain(h.bias, &h.levels).unwrap();
    }

    #[test]
    fn bearish_chain_is_mirrored() {
        let h = derive_horizon(100.0, 2.0, Bias::Bearish, Horizon::ShortTerm, None);
        assert_eq!(h.levels.entry_range, [99.5, 100.5]);
        assert_eq!(h.levels.stop_loss, 102.5);
        assert_eq!(h.levels.targets, vec![96.5, 94.5]);
        validate_chain(h.bias, &h.levels).unwrap();
    }

    #[test]
    fn all_horizons_satisfy_chain_for_all_biases() {
        for bias in [Bias::Bullish, Bias::Bearish, Bias::Neutral] {
            for horizon in Horizon::ALL {
                let h = derive_horizon(250.0, 3.7, bias, horizon, None);
                validate_chain(h.bias, &h.levels)
                    .unwrap_or_else(|e| panic!("{bias} {horizon}: {e}"));
            }
        }
    }

    #[test]
    fn wider_horizons_have_wider_levels() {
        let short = derive_horizon(100.0, 2.0, Bias::Bullish, Horizon::ShortTerm, None);
        let long = derive_horizon(100.0, 2.0, Bias::Bullish, Horizon::LongTerm, None);
        assert!(long.levels.stop_loss < short.levels.stop_loss);
        assert!(long.levels.targets[0] > short.levels.targets[0]);
        let short_width = short.levels.entry_range[1] - short.levels.entry_range[0];
        let long_width = long.levels.entry_range[1] - long.levels.entry_range[0];
        assert!(long_width > short_width);
    }

    #[test]
    fn tick_size_rounding() {
        assert_eq!(round_price(100.017, Some(0.05)), 100.0);
        assert_eq!(round_price(100.03, Some(0.05)), 100.05);
        assert_eq!(round_price(100.123456, None), 100.1235);
    }

    #[test]
    fn chain_validation_rejects_violations() {
        let bad_stop = LevelSet {
            entry_range: [99.0, 101.0],
            stop_loss: 99.5, // inside the entry range
            targets: vec![105.0, 109.0],
        };
        assert!(validate_chain(Bias::Bullish, &bad_stop).is_err());

        let unordered_targets = LevelSet {
            entry_range: [99.0, 101.0],
            stop_loss: 97.0,
            targets: vec![109.0, 105.0],
        };
        assert!(validate_chain(Bias::Bullish, &unordered_targets).is_err());

        let empty_targets = LevelSet {
            entry_range: [99.0, 101.0],
            stop_loss: 97.0,
            targets: vec![],
        };
        assert!(validate_chain(Bias::Bullish, &empty_targets).is_err());

        let good_bearish = LevelSet {
            entry_range: [99.0, 101.0],
            stop_loss: 103.0,
            targets: vec![95.0, 91.0],
        };
        assert!(validate_chain(Bias::Bearish, &good_bearish).is_ok());
    }

    #[test]
    fn fixture_levels_from_scenarios_validate() {
        // The bullish-alignment fixture: entry [99, 101], stop 97,
        // targets [105, 109].
        let levels = LevelSet {
            entry_range: [99.0, 101.0],
            stop_loss: 97.0,
            targets: vec![105.0, 109.0],
        };
        assert!(validate_chain(Bias::Bullish, &levels).is_ok());
        assert!(validate_chain(Bias::Bearish, &levels).is_err());
    }
}
