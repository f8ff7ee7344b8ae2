// =============================================================================
// Candle Aggregator — folds admitted ticks into OHLCV buckets
// =============================================================================
//
// Buckets are half-open `[start, start + duration)`: a tick whose timestamp
// equals a bucket end opens the *next* bucket. Each fold emits a cheap
// `Rolling` snapshot; crossing a bucket boundary freezes the old candle and
// emits it as `Closed`. A frozen candle is never mutated again.
//
// Gap handling: the aggregator never synthesises empty bars. With no new
// tick the current bar simply stays open; back-filling missing bars is a
// historical-data concern of the provider. `close_all` exists for session
// end and feed shutdown.
//
// Volume: the feed adapter declares whether `volume_traded` is a cumulative
// daily figure or a per-tick delta. The aggregator never guesses.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Tick, Timeframe};

// =============================================================================
// Data types
// =============================================================================

/// A single OHLCV candle for one (token, timeframe) bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub token: i64,
    pub timeframe: Timeframe,
    /// Bucket start, UTC ms. Invariant: `start < end`.
    pub start: i64,
    /// Bucket end, UTC ms. Invariant: `end - start == timeframe.duration_ms()`.
    pub end: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Per-bar volume. Invariant: `volume >= 0`.
    pub volume: f64,
}

impl Candle {
    /// Check the structural invariants. Violations indicate a bug upstream,
    /// not bad market data.
    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
            && self.end - self.start == self.timeframe.duration_ms()
            && self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.volume >= 0.0
    }
}

/// Whether a candle snapshot is still mutating or final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleStage {
    Rolling,
    Closed,
}

/// One aggregation output: a candle snapshot at a stage.
#[derive(Debug, Clone)]
pub struct CandleEvent {
    pub stage: CandleStage,
    pub candle: Candle,
}

/// How the feed reports volume on ticks. Declared per feed adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMode {
    /// `volume_traded` is the cumulative daily volume; per-bar volume is
    /// `current_cum - cum_at_last_bar_close`.
    #[default]
    CumulativeDaily,
    /// `volume_traded` is the size of this tick; per-bar volume sums ticks.
    PerTickDelta,
}

// =============================================================================
// TokenAggregator
// =============================================================================

struct Bucket {
    candle: Candle,
    /// Cumulative volume at the moment this bucket opened (CumulativeDaily
    /// mode only).
    cum_anchor: f64,
    /// Last cumulative figure seen inside this bucket.
    last_cum: f64,
}

/// Aggregation state for a single token across all tracked timeframes.
/// Owned exclusively by the token's ingest actor — single-writer by
/// construction, no locks on the hot path.
pub struct TokenAggregator {
    token: i64,
    mode: VolumeMode,
    timeframes: Vec<Timeframe>,
    buckets: HashMap<Timeframe, Bucket>,
}

impl TokenAggregator {
    pub fn new(token: i64, mode: VolumeMode, timeframes: &[Timeframe]) -> Self {
        Self {
            token,
            mode,
            timeframes: timeframes.to_vec(),
            buckets: HashMap::new(),
        }
    }

    /// Fold one admitted tick into every tracked timeframe. Returns the
    /// emitted events: zero or one `Closed` plus exactly one `Rolling` per
    /// timeframe (late out-of-order ticks emit nothing for that timeframe).
    pub fn fold(&mut self, tick: &Tick) -> Vec<CandleEvent> {
        let mut events = Vec::with_capacity(self.timeframes.len() + 1);

        for idx in 0..self.timeframes.len() {
            let tf = self.timeframes[idx];
            let start = tf.bucket_start(tick.timestamp);
            let current_start = self.buckets.get(&tf).map(|b| b.candle.start);

            match current_start {
                None => {
                    let bucket = self.open_bucket(tf, start, tick, None);
                    events.push(CandleEvent {
                        stage: CandleStage::Rolling,
                        candle: bucket.candle.clone(),
                    });
                    self.buckets.insert(tf, bucket);
                }
                Some(open_start) if start == open_start => {
                    let mode = self.mode;
                    if let Some(bucket) = self.buckets.get_mut(&tf) {
                        Self::update_bucket(bucket, tick, mode);
                        events.push(CandleEvent {
                            stage: CandleStage::Rolling,
                            candle: bucket.candle.clone(),
                        });
                    }
                }
                Some(open_start) if start > open_start => {
                    // Boundary crossed: freeze the old bucket, then open the
                    // new one anchored at the frozen bucket's volume state.
                    let Some(frozen) = self.buckets.remove(&tf) else {
                        continue;
                    };
                    let carry = frozen.last_cum;
                    events.push(CandleEvent {
                        stage: CandleStage::Closed,
                        candle: frozen.candle,
                    });
                    let fresh = self.open_bucket(tf, start, tick, Some(carry));
                    events.push(CandleEvent {
                        stage: CandleStage::Rolling,
                        candle: fresh.candle.clone(),
                    });
                    self.buckets.insert(tf, fresh);
                }
                Some(open_start) => {
                    // Tick from an already-frozen bucket; frozen candles are
                    // never reopened.
                    debug!(
                        token = self.token,
                        timeframe = %tf,
                        tick_ts = tick.timestamp,
                        bucket_start = open_start,
                        "late tick ignored"
                    );
                }
            }
        }

        events
    }

    /// Freeze and emit every open bucket. Called at session end and on feed
    /// shutdown; never on mere tick gaps.
    pub fn close_all(&mut self) -> Vec<CandleEvent> {
        let mut events: Vec<CandleEvent> = self
            .buckets
            .drain()
            .map(|(_, bucket)| CandleEvent {
                stage: CandleStage::Closed,
                candle: bucket.candle,
            })
            .collect();
        events.sort_by_key(|e| (e.candle.timeframe, e.candle.start));
        events
    }

    fn open_bucket(
        &self,
        tf: Timeframe,
        start: i64,
        tick: &Tick,
        cum_carry: Option<f64>,
    ) -> Bucket {
        let (volume, anchor) = match self.mode {
            VolumeMode::PerTickDelta => (tick.volume_traded, 0.0),
            VolumeMode::CumulativeDaily => {
                let mut anchor = cum_carry.unwrap_or(tick.volume_traded);
                // A cumulative figure below the anchor means the daily
                // counter reset; restart the anchor at zero.
                if tick.volume_traded < anchor {
                    anchor = 0.0;
                }
                (tick.volume_traded - anchor, anchor)
            }
        };

        Bucket {
            candle: Candle {
                token: self.token,
                timeframe: tf,
                start,
                end: start + tf.duration_ms(),
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume,
            },
            cum_anchor: anchor,
            last_cum: tick.volume_traded,
        }
    }

    fn update_bucket(bucket: &mut Bucket, tick: &Tick, mode: VolumeMode) {
        let c = &mut bucket.candle;
        c.high = c.high.max(tick.price);
        c.low = c.low.min(tick.price);
        c.close = tick.price;

        match mode {
            VolumeMode::PerTickDelta => {
                c.volume += tick.volume_traded;
            }
            VolumeMode::CumulativeDaily => {
                if tick.volume_traded < bucket.cum_anchor {
                    // Daily counter reset mid-bucket; re-anchor.
                    bucket.cum_anchor = 0.0;
                }
                c.volume = (tick.volume_traded - bucket.cum_anchor).max(0.0);
                bucket.last_cum = tick.volume_traded;
            }
        }
    }
}

// =============================================================================
// CandleStore — ring buffer of closed candles per (token, timeframe)
// =============================================================================

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub token: i64,
    pub timeframe: Timeframe,
}

struct SeriesRing {
    closed: VecDeque<Candle>,
    rolling: Option<Candle>,
}

/// Thread-safe store of recent candles, fed by aggregation events and read
/// by the chart API and the re-analysis trigger.
pub struct CandleStore {
    series: RwLock<HashMap<SeriesKey, SeriesRing>>,
    max_closed: usize,
}

impl CandleStore {
    pub fn new(max_closed: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_closed,
        }
    }

    /// Apply one aggregation event.
    pub fn apply(&self, event: &CandleEvent) {
        let key = SeriesKey {
            token: event.candle.token,
            timeframe: event.candle.timeframe,
        };
        let mut map = self.series.write();
        let ring = map.entry(key).or_insert_with(|| SeriesRing {
            closed: VecDeque::with_capacity(self.max_closed + 1),
            rolling: None,
        });

        match event.stage {
            CandleStage::Rolling => {
                ring.rolling = Some(event.candle.clone());
            }
            CandleStage::Closed => {
                let superseded = ring
                    .rolling
                    .as_ref()
                    .map_or(false, |r| r.start == event.candle.start);
                if superseded {
                    ring.rolling = None;
                }
                ring.closed.push_back(event.candle.clone());
                while ring.closed.len() > self.max_closed {
                    ring.closed.pop_front();
                }
            }
        }
    }

    /// The most recent `count` closed candles, oldest first.
    pub fn closed(&self, token: i64, timeframe: Timeframe, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(&SeriesKey { token, timeframe }) {
            Some(ring) => {
                let skip = ring.closed.len().saturating_sub(count);
                ring.closed.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// The current in-progress candle, if any.
    pub fn rolling(&self, token: i64, timeframe: Timeframe) -> Option<Candle> {
        let map = self.series.read();
        map.get(&SeriesKey { token, timeframe })
            .and_then(|ring| ring.rolling.clone())
    }

    pub fn last_close(&self, token: i64, timeframe: Timeframe) -> Option<f64> {
        let map = self.series.read();
        map.get(&SeriesKey { token, timeframe })
            .and_then(|ring| ring.closed.back().map(|c| c.close))
    }
}
