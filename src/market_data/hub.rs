// =============================================================================
// Stream Hub — per-subscriber fan-out with selective back-pressure
// =============================================================================
//
// Each subscriber owns a bounded FIFO queue. The publisher writes without
// blocking; on overflow the oldest *tick* envelope is discarded first, then
// the oldest rolling candle. Closed-candle and backend_error envelopes are
// never dropped — the queue may transiently exceed its bound to honour that.
// Drops are counted per subscriber and surfaced as metrics.
//
// Filter updates are atomic swaps. Delivery after an update is eventually
// consistent: envelopes already queued may still arrive, which is acceptable
// because every envelope is self-describing (token + timeframe).
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::market_data::aggregator::{Candle, CandleStage};
use crate::types::{Tick, Timeframe};

// =============================================================================
// Envelopes (wire contract)
// =============================================================================

/// Candle payload inside a candle envelope.
#[derive(Debug, Clone, Serialize)]
pub struct CandleData {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub start: i64,
    pub end: i64,
}

impl From<&Candle> for CandleData {
    fn from(c: &Candle) -> Self {
        Self {
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            start: c.start,
            end: c.end,
        }
    }
}

/// Server -> client envelope. The `type` tags, field names, and the
/// `rolling|closed` stage strings are part of the wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Tick {
        token: i64,
        price: f64,
        volume_traded: f64,
        timestamp: i64,
    },
    Candle {
        token: i64,
        timeframe: Timeframe,
        data: CandleData,
        stage: CandleStage,
        timestamp: i64,
    },
    BackendError {
        error: String,
        context: serde_json::Value,
        timestamp: i64,
    },
}

impl Envelope {
    pub fn tick(t: &Tick) -> Self {
        Envelope::Tick {
            token: t.token,
            price: t.price,
            volume_traded: t.volume_traded,
            timestamp: t.timestamp,
        }
    }

    pub fn candle(candle: &Candle, stage: CandleStage, now_ms: i64) -> Self {
        Envelope::Candle {
            token: candle.token,
            timeframe: candle.timeframe,
            data: CandleData::from(candle),
            stage,
            timestamp: now_ms,
        }
    }

    pub fn backend_error(error: impl Into<String>, context: serde_json::Value, now_ms: i64) -> Self {
        Envelope::BackendError {
            error: error.into(),
            context,
            timestamp: now_ms,
        }
    }

    /// Droppable envelopes may be discarded under back-pressure. Closed
    /// candles and errors are not droppable.
    fn drop_class(&self) -> DropClass {
        match self {
            Envelope::Tick { .. } => DropClass::Tick,
            Envelope::Candle {
                stage: CandleStage::Rolling,
                ..
            } => DropClass::Rolling,
            _ => DropClass::Never,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum DropClass {
    Tick,
    Rolling,
    Never,
}

// =============================================================================
// Subscription filter
// =============================================================================

/// What a subscriber wants: bare tokens (tick envelopes) and (token,
/// timeframe) series (candle envelopes). Replaced whole on update.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub tokens: HashSet<i64>,
    pub series: HashSet<(i64, Timeframe)>,
}

impl SubscriptionFilter {
    /// Build the filter the WS protocol implies: every requested token gets
    /// tick envelopes, and the cross product with the requested timeframes
    /// gets candle envelopes.
    pub fn for_subscription(tokens: &[i64], timeframes: &[Timeframe]) -> Self {
        let mut series = HashSet::new();
        for &token in tokens {
            for &tf in timeframes {
                series.insert((token, tf));
            }
        }
        Self {
            tokens: tokens.iter().copied().collect(),
            series,
        }
    }

    fn matches(&self, env: &Envelope) -> bool {
        match env {
            Envelope::Tick { token, .. } => self.tokens.contains(token),
            Envelope::Candle {
                token, timeframe, ..
            } => self.series.contains(&(*token, *timeframe)),
            // Error envelopes are never suppressed by a filter.
            Envelope::BackendError { .. } => true,
        }
    }
}

// =============================================================================
// Subscriber
// =============================================================================

struct SubscriberInner {
    id: u64,
    filter: RwLock<SubscriptionFilter>,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
    dropped_ticks: AtomicU64,
    dropped_rolling: AtomicU64,
    detached: AtomicBool,
}

impl SubscriberInner {
    /// Push an envelope, applying the selective drop policy on overflow.
    fn push(&self, env: Envelope) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(env);

            if queue.len() > self.capacity {
                // Prefer discarding the oldest tick; then the oldest rolling
                // candle; otherwise allow the transient overflow.
                if let Some(pos) = queue
                    .iter()
                    .position(|e| e.drop_class() == DropClass::Tick)
                {
                    queue.remove(pos);
                    self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                } else if let Some(pos) = queue
                    .iter()
                    .position(|e| e.drop_class() == DropClass::Rolling)
                {
                    queue.remove(pos);
                    self.dropped_rolling.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.notify.notify_one();
    }
}

/// Receiving half of a subscription. Dropping it detaches the subscriber
/// from the hub.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
    hub: Arc<HubShared>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Next envelope, FIFO. Returns `None` once detached and drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            if let Some(env) = self.inner.queue.lock().pop_front() {
                return Some(env);
            }
            if self.inner.detached.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking pop, for draining in tests.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.inner.queue.lock().pop_front()
    }

    /// Atomically replace the subscription filter.
    pub fn update_filter(&self, filter: SubscriptionFilter) {
        *self.inner.filter.write() = filter;
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.inner.dropped_ticks.load(Ordering::Relaxed)
    }

    pub fn dropped_rolling(&self) -> u64 {
        self.inner.dropped_rolling.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.detached.store(true, Ordering::Release);
        self.hub.table.write().remove(&self.inner.id);
        debug!(subscriber = self.inner.id, "subscriber detached");
    }
}

// =============================================================================
// Hub
// =============================================================================

struct HubShared {
    table: RwLock<HashMap<u64, Arc<SubscriberInner>>>,
}

/// Aggregate hub counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HubMetrics {
    pub subscribers: usize,
    pub published: u64,
    pub dropped_ticks: u64,
    pub dropped_rolling: u64,
}

/// The fan-out hub. Publishing holds the subscriber table lock only long
/// enough to collect the recipient list; queue pushes happen outside it.
pub struct StreamHub {
    shared: Arc<HubShared>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
}

impl StreamHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(HubShared {
                table: RwLock::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
            capacity,
            published: AtomicU64::new(0),
        }
    }

    /// Register a subscriber with an empty filter.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(SubscriberInner {
            id,
            filter: RwLock::new(SubscriptionFilter::default()),
            queue: Mutex::new(VecDeque::with_capacity(self.capacity + 1)),
            notify: Notify::new(),
            capacity: self.capacity,
            dropped_ticks: AtomicU64::new(0),
            dropped_rolling: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });
        self.shared.table.write().insert(id, inner.clone());
        debug!(subscriber = id, "subscriber registered");
        Subscriber {
            inner,
            hub: self.shared.clone(),
        }
    }

    /// Deliver an envelope to every subscriber whose current filter matches.
    /// Never blocks and never fails the publisher.
    pub fn publish(&self, env: &Envelope) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let recipients: Vec<Arc<SubscriberInner>> = {
            let table = self.shared.table.read();
            table.values().cloned().collect()
        };

        for sub in recipients {
            let matches = sub.filter.read().matches(env);
            if matches {
                sub.push(env.clone());
            }
        }
    }

    pub fn metrics(&self) -> HubMetrics {
        let table = self.shared.table.read();
        let mut dropped_ticks = 0;
        let mut dropped_rolling = 0;
        for sub in table.values() {
            dropped_ticks += sub.dropped_ticks.load(Ordering::Relaxed);
            dropped_rolling += sub.dropped_rolling.load(Ordering::Relaxed);
        }
        HubMetrics {
            subscribers: table.len(),
            published: self.published.load(Ordering::Relaxed),
            dropped_ticks,
            dropped_rolling,
        }
    }
}
