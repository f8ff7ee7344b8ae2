// =============================================================================
// Candle Dataset Cache — freshness contract only
// =============================================================================
//
// Caches fetched candle datasets per (symbol, interval) with the TTL chosen
// by the market-hours policy. The engine must keep working with this cache
// empty; a hit is an optimisation, never a correctness requirement. Reads are
// lock-cheap; a stale entry is evicted on the next read.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::market_data::aggregator::Candle;
use crate::market_hours::SourceClass;
use crate::types::Timeframe;

/// One cached dataset with its freshness metadata.
#[derive(Clone)]
pub struct CachedDataset {
    pub candles: Arc<Vec<Candle>>,
    pub created_at: Instant,
    pub ttl: Duration,
    pub source_class: SourceClass,
    /// Content identity; equal fingerprints mean the same underlying dataset.
    pub fingerprint: u64,
}

impl CachedDataset {
    pub fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }

    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }
}

/// Thread-safe dataset cache keyed by (symbol, interval).
pub struct CandleCache {
    entries: RwLock<HashMap<(String, Timeframe), CachedDataset>>,
}

impl CandleCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh dataset for the key, if any. Expired entries are evicted here
    /// rather than by a background sweeper.
    pub fn get(&self, symbol: &str, interval: Timeframe) -> Option<CachedDataset> {
        let key = (symbol.to_string(), interval);
        {
            let entries = self.entries.read();
            match entries.get(&key) {
                Some(entry) if entry.is_fresh() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Entry existed but expired; evict under the write lock.
        let mut entries = self.entries.write();
        let still_fresh = entries.get(&key).map(|e| e.is_fresh());
        match still_fresh {
            Some(true) => entries.get(&key).cloned(),
            Some(false) => {
                entries.remove(&key);
                debug!(symbol, interval = %interval, "cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Store a dataset under the policy-provided TTL and source class.
    pub fn put(
        &self,
        symbol: &str,
        interval: Timeframe,
        candles: Arc<Vec<Candle>>,
        ttl_seconds: u64,
        source_class: SourceClass,
    ) -> CachedDataset {
        let entry = CachedDataset {
            fingerprint: fingerprint(&candles),
            candles,
            created_at: Instant::now(),
            ttl: Duration::from_secs(ttl_seconds),
            source_class,
        };
        self.entries
            .write()
            .insert((symbol.to_string(), interval), entry.clone());
        entry
    }

    /// Explicit invalidation for one (symbol, interval). Returns whether an
    /// entry was present.
    pub fn invalidate(&self, symbol: &str, interval: Timeframe) -> bool {
        let removed = self
            .entries
            .write()
            .remove(&(symbol.to_string(), interval))
            .is_some();
        if removed {
            debug!(symbol, interval = %interval, "cache entry invalidated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for CandleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap content identity over a candle dataset.
fn fingerprint(candles: &[Candle]) -> u64 {
    let mut hasher = DefaultHasher::new();
    candles.len().hash(&mut hasher);
    for c in candles {
        c.start.hash(&mut hasher);
        c.close.to_bits().hash(&mut hasher);
        c.volume.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}
