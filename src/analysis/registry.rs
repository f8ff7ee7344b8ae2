// =============================================================================
// Analyzer Registry — the closed set of specialists, keyed by id
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use crate::analysis::agent::Analyzer;
use crate::analysis::agents;
use crate::llm::LlmClient;
use crate::provider::CandleSource;

/// Analyzer ids the MTF aggregator runs per timeframe: the indicator,
/// pattern, and volume specialists. Sector, ML, and the LLM narrative run
/// once on the request interval only.
pub const MTF_ANALYZER_IDS: [&str; 7] = [
    agents::technical::TREND_ID,
    agents::technical::MOMENTUM_ID,
    agents::technical::VOLATILITY_ID,
    agents::technical::TREND_STRENGTH_ID,
    agents::patterns::CHART_PATTERNS_ID,
    agents::patterns::CANDLESTICK_ID,
    agents::volume::VOLUME_REGIME_ID,
];

/// Registry of all available analyzers.
pub struct AnalyzerRegistry {
    agents: HashMap<&'static str, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn empty() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// The full production analyzer set.
    pub fn standard(
        llm: Arc<LlmClient>,
        sector_source: Arc<dyn CandleSource>,
        sector_benchmark: String,
    ) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(agents::technical::TrendFollowingAnalyzer));
        registry.register(Arc::new(agents::technical::MomentumAnalyzer));
        registry.register(Arc::new(agents::technical::VolatilityAnalyzer));
        registry.register(Arc::new(agents::technical::TrendStrengthAnalyzer));
        registry.register(Arc::new(agents::technical::SupportResistanceAnalyzer));
        registry.register(Arc::new(agents::patterns::ChartPatternAnalyzer));
        registry.register(Arc::new(agents::patterns::CandlestickAnalyzer));
        registry.register(Arc::new(agents::volume::VolumeRegimeAnalyzer));
        registry.register(Arc::new(agents::sector::SectorBenchmarkAnalyzer::new(
            sector_source,
            sector_benchmark,
        )));
        registry.register(Arc::new(agents::ml::MlPredictorAnalyzer));
        registry.register(Arc::new(agents::insight::LlmInsightAnalyzer::new(llm)));
        registry
    }

    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        self.agents.insert(analyzer.spec().id, analyzer);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Analyzer>> {
        self.agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.agents.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
