// =============================================================================
// Live Market Tick Subsystem
// =============================================================================
//
// tick feed (WS) -> tick gate -> candle aggregator -> fan-out hub
//
// The per-token path is single-writer: all ticks for one token are serialised
// through that token's ingest actor, which owns the gate and aggregator state
// for the token. Cross-token work is parallel. Snapshots handed to the hub
// and the candle store are immutable copies.
// =============================================================================

pub mod aggregator;
pub mod feed;
pub mod hub;
pub mod tick_gate;

pub use aggregator::{Candle, CandleStage, CandleStore, TokenAggregator, VolumeMode};
pub use hub::{Envelope, StreamHub, Subscriber, SubscriptionFilter};
pub use tick_gate::{GateMetrics, TickGate};
