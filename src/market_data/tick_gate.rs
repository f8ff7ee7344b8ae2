// =============================================================================
// Tick Gate — duplicate, stale, and malformed tick filtering
// =============================================================================
//
// `admit` is side-effect-free apart from the per-token cache update and the
// shared counters. A bad tick never kills the stream: every rejection is a
// counted verdict, not an error.
//
// Rules:
//   - The first tick ever seen for a token is always admitted.
//   - While the market is OPEN, ticks are admitted unconditionally.
//   - Outside OPEN, a tick equal to the last admitted one in (price AND
//     volume_traded) and younger than the duplicate window is dropped.
//   - Malformed ticks (non-finite or non-positive price, negative cumulative
//     volume, timestamp off the wall clock by more than an hour) are
//     rejected regardless of session status.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::runtime_config::GateConfig;
use crate::types::{MarketStatus, Tick};

// =============================================================================
// Verdicts
// =============================================================================

/// Why a tick was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    DuplicateClosed,
    MalformedPrice,
    MalformedVolume,
    ClockSkew,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::DuplicateClosed => "duplicate_closed",
            DropReason::MalformedPrice => "malformed_price",
            DropReason::MalformedVolume => "malformed_volume",
            DropReason::ClockSkew => "clock_skew",
        }
    }

    /// Malformed ticks count toward the backend_error threshold; duplicates
    /// do not.
    pub fn is_malformed(self) -> bool {
        !matches!(self, DropReason::DuplicateClosed)
    }
}

// =============================================================================
// Shared metrics
// =============================================================================

/// Counters shared across all per-token gates, surfaced on the metrics
/// endpoint and used for the rolling malformed-tick threshold.
pub struct GateMetrics {
    pub admitted: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub clock_skew: AtomicU64,
    /// Timestamps (ms) of recent malformed rejections, for the rolling
    /// window check.
    recent_malformed: Mutex<VecDeque<i64>>,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            clock_skew: AtomicU64::new(0),
            recent_malformed: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_admit(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason, now_ms: i64) {
        match reason {
            DropReason::DuplicateClosed => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            DropReason::ClockSkew => {
                self.clock_skew.fetch_add(1, Ordering::Relaxed);
                self.push_malformed(now_ms);
            }
            DropReason::MalformedPrice | DropReason::MalformedVolume => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                self.push_malformed(now_ms);
            }
        }
    }

    /// Malformed rejections within the rolling window ending at `now_ms`.
    pub fn malformed_in_window(&self, now_ms: i64, window_ms: i64) -> u64 {
        let mut recent = self.recent_malformed.lock();
        while let Some(&front) = recent.front() {
            if now_ms - front > window_ms {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.len() as u64
    }

    fn push_malformed(&self, now_ms: i64) {
        let mut recent = self.recent_malformed.lock();
        recent.push_back(now_ms);
        // Bound the deque so a flood cannot grow it without limit.
        while recent.len() > 10_000 {
            recent.pop_front();
        }
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Per-token gate
// =============================================================================

/// Gate state for a single token. Owned by that token's ingest actor; not
/// shared, not locked.
pub struct TickGate {
    cfg: GateConfig,
    last_admitted: Option<Tick>,
}

impl TickGate {
    pub fn new(cfg: GateConfig) -> Self {
        Self {
            cfg,
            last_admitted: None,
        }
    }

    /// Decide whether to admit `tick`. `now_ms` is the wall clock; `status`
    /// is the session hint used for the duplicate window.
    pub fn admit(
        &mut self,
        tick: &Tick,
        status: MarketStatus,
        now_ms: i64,
    ) -> Result<(), DropReason> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(DropReason::MalformedPrice);
        }
        if !tick.volume_traded.is_finite() || tick.volume_traded < 0.0 {
            return Err(DropReason::MalformedVolume);
        }
        if (now_ms - tick.timestamp).abs() > self.cfg.max_clock_skew_ms {
            return Err(DropReason::ClockSkew);
        }

        if let Some(last) = &self.last_admitted {
            let window = if status.is_open() {
                0
            } else {
                self.cfg.closed_dup_window_ms
            };
            let same = tick.price == last.price && tick.volume_traded == last.volume_traded;
            let age = tick.timestamp - last.timestamp;
            if same && age < window {
                debug!(token = tick.token, price = tick.price, "duplicate tick dropped");
                return Err(DropReason::DuplicateClosed);
            }
        }

        self.last_admitted = Some(tick.clone());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, volume: f64, ts: i64) -> Tick {
        Tick {
            token: 42,
            price,
            volume_traded: volume,
            timestamp: ts,
            bid: None,
            ask: None,
        }
    }

    fn gate() -> TickGate {
        TickGate::new(GateConfig::default())
    }

    #[test]
    fn first_tick_always_admitted() {
        let mut g = gate();
        assert!(g.admit(&tick(100.0, 10.0, 1_000), MarketStatus::Closed, 1_000).is_ok());
    }

    #[test]
    fn duplicate_during_closed_hours_dropped() {
        // Ten identical ticks inside the window -> exactly one admit.
        let mut g = gate();
        let mut admits = 0;
        for i in 0..10 {
            let t = tick(100.0, 10.0, 1_000 + i * 1_000);
            if g.admit(&t, MarketStatus::Closed, t.timestamp).is_ok() {
                admits += 1;
            }
        }
        assert_eq!(admits, 1);

        // A differing price is admitted immediately.
        let t = tick(100.5, 10.0, 12_000);
        assert!(g.admit(&t, MarketStatus::Closed, t.timestamp).is_ok());
    }

    #[test]
    fn duplicate_during_open_admitted() {
        let mut g = gate();
        let a = tick(100.0, 10.0, 1_000);
        let b = tick(100.0, 10.0, 2_000);
        assert!(g.admit(&a, MarketStatus::Open, 1_000).is_ok());
        assert!(g.admit(&b, MarketStatus::Open, 2_000).is_ok());
    }

    #[test]
    fn duplicate_outside_window_admitted() {
        let mut g = gate();
        let a = tick(100.0, 10.0, 0);
        let b = tick(100.0, 10.0, 31_000);
        assert!(g.admit(&a, MarketStatus::Closed, 0).is_ok());
        assert!(g.admit(&b, MarketStatus::Closed, 31_000).is_ok());
    }

    #[test]
    fn weekend_uses_closed_window() {
        let mut g = gate();
        let a = tick(100.0, 10.0, 0);
        let b = tick(100.0, 10.0, 5_000);
        assert!(g.admit(&a, MarketStatus::Weekend, 0).is_ok());
        assert_eq!(
            g.admit(&b, MarketStatus::Weekend, 5_000),
            Err(DropReason::DuplicateClosed)
        );
    }

    #[test]
    fn malformed_price_rejected() {
        let mut g = gate();
        assert_eq!(
            g.admit(&tick(f64::NAN, 1.0, 0), MarketStatus::Open, 0),
            Err(DropReason::MalformedPrice)
        );
        assert_eq!(
            g.admit(&tick(0.0, 1.0, 0), MarketStatus::Open, 0),
            Err(DropReason::MalformedPrice)
        );
        assert_eq!(
            g.admit(&tick(-5.0, 1.0, 0), MarketStatus::Open, 0),
            Err(DropReason::MalformedPrice)
        );
    }

    #[test]
    fn clock_skew_rejected() {
        let mut g = gate();
        let now = 10_000_000_000_i64;
        let skewed = tick(100.0, 1.0, now - 2 * 3_600_000);
        assert_eq!(
            g.admit(&skewed, MarketStatus::Open, now),
            Err(DropReason::ClockSkew)
        );
    }

    #[test]
    fn rejection_does_not_update_cache() {
        // A rejected duplicate must not refresh the window anchor.
        let mut g = gate();
        let a = tick(100.0, 10.0, 0);
        assert!(g.admit(&a, MarketStatus::Closed, 0).is_ok());
        let dup = tick(100.0, 10.0, 29_000);
        assert!(g.admit(&dup, MarketStatus::Closed, 29_000).is_err());
        // 31s after the *admitted* tick, not the rejected one.
        let later = tick(100.0, 10.0, 31_000);
        assert!(g.admit(&later, MarketStatus::Closed, 31_000).is_ok());
    }

    #[test]
    fn metrics_rolling_window() {
        let m = GateMetrics::new();
        for i in 0..5 {
            m.record_drop(DropReason::MalformedPrice, i * 1_000);
        }
        assert_eq!(m.malformed_in_window(4_000, 60_000), 5);
        assert_eq!(m.malformed_in_window(100_000, 60_000), 5);
        assert_eq!(m.malformed_in_window(200_000, 60_000), 0);
        assert_eq!(m.malformed.load(Ordering::Relaxed), 5);
    }
}
