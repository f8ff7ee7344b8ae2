// =============================================================================
// Instrument Map — token <-> symbol resolution
// =============================================================================
//
// Loaded at startup from the provider and refreshed on a slow timer. The
// hot path is read-only; the refresh is the single writer and swaps both
// indexes together under one short-held lock.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

/// One tradeable instrument from the provider's master list.
#[derive(Debug, Clone, Serialize)]
pub struct Instrument {
    pub token: i64,
    pub symbol: String,
    pub exchange: String,
    pub name: String,
    /// Minimum price increment, when the provider knows it.
    pub tick_size: Option<f64>,
}

struct Indexes {
    by_token: HashMap<i64, Instrument>,
    by_symbol: HashMap<(String, String), i64>,
}

/// Thread-safe instrument lookup table.
pub struct InstrumentMap {
    indexes: RwLock<Indexes>,
}

impl InstrumentMap {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes {
                by_token: HashMap::new(),
                by_symbol: HashMap::new(),
            }),
        }
    }

    /// Replace the whole table. Called by the refresh loop only.
    pub fn replace(&self, instruments: Vec<Instrument>) {
        let mut by_token = HashMap::with_capacity(instruments.len());
        let mut by_symbol = HashMap::with_capacity(instruments.len());

        for inst in instruments {
            by_symbol.insert(
                (inst.symbol.to_uppercase(), inst.exchange.to_uppercase()),
                inst.token,
            );
            by_token.insert(inst.token, inst);
        }

        let count = by_token.len();
        *self.indexes.write() = Indexes {
            by_token,
            by_symbol,
        };
        info!(count, "instrument map refreshed");
    }

    pub fn by_token(&self, token: i64) -> Option<Instrument> {
        self.indexes.read().by_token.get(&token).cloned()
    }

    pub fn by_symbol(&self, symbol: &str, exchange: &str) -> Option<Instrument> {
        let indexes = self.indexes.read();
        let token = indexes
            .by_symbol
            .get(&(symbol.to_uppercase(), exchange.to_uppercase()))?;
        indexes.by_token.get(token).cloned()
    }

    pub fn tick_size(&self, symbol: &str, exchange: &str) -> Option<f64> {
        self.by_symbol(symbol, exchange).and_then(|i| i.tick_size)
    }

    pub fn len(&self) -> usize {
        self.indexes.read().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InstrumentMap {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Instrument> {
        vec![
            Instrument {
                token: 256265,
                symbol: "ACME".into(),
                exchange: "NSE".into(),
                name: "Acme Industries".into(),
                tick_size: Some(0.05),
            },
            Instrument {
                token: 260105,
                symbol: "GLOBEX".into(),
                exchange: "NSE".into(),
                name: "Globex Corp".into(),
                tick_size: None,
            },
        ]
    }

    #[test]
    fn lookup_both_directions() {
        let map = InstrumentMap::new();
        map.replace(sample());

        assert_eq!(map.by_token(256265).unwrap().symbol, "ACME");
        assert_eq!(map.by_symbol("acme", "nse").unwrap().token, 256265);
        assert!(map.by_token(1).is_none());
        assert!(map.by_symbol("ACME", "BSE").is_none());
    }

    #[test]
    fn replace_swaps_atomically() {
        let map = InstrumentMap::new();
        map.replace(sample());
        assert_eq!(map.len(), 2);

        map.replace(vec![Instrument {
            token: 1,
            symbol: "SOLO".into(),
            exchange: "NSE".into(),
            name: String::new(),
            tick_size: None,
        }]);
        assert_eq!(map.len(), 1);
        assert!(map.by_token(256265).is_none());
        assert_eq!(map.by_symbol("SOLO", "NSE").unwrap().token, 1);
    }

    #[test]
    fn tick_size_lookup() {
        let map = InstrumentMap::new();
        map.replace(sample());
        assert_eq!(map.tick_size("ACME", "NSE"), Some(0.05));
        assert_eq!(map.tick_size("GLOBEX", "NSE"), None);
    }
}
