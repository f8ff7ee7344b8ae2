// =============================================================================
// Market Data Provider — external adapter
// =============================================================================

pub mod client;
pub mod instruments;

pub use client::{CandleSource, MarketDataClient};
pub use instruments::{Instrument, InstrumentMap};
