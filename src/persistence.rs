// =============================================================================
// Decision Persistence — storage seam plus the in-memory ring
// =============================================================================
//
// The engine only constrains the record shape; where records ultimately land
// (database, object store) is an integration concern behind this trait. The
// in-memory implementation doubles as the dashboard's recent-decisions feed.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::analysis::decision::{AnalysisArtifact, DecisionRecord};

/// Sink for finished analyses.
pub trait DecisionStore: Send + Sync {
    fn save(&self, artifact: AnalysisArtifact);
    fn recent(&self, count: usize) -> Vec<DecisionRecord>;
    fn last(&self) -> Option<AnalysisArtifact>;
    fn len(&self) -> usize;
}

/// Ring-buffered in-memory store.
pub struct InMemoryDecisionStore {
    artifacts: RwLock<VecDeque<AnalysisArtifact>>,
    max_records: usize,
}

impl InMemoryDecisionStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            artifacts: RwLock::new(VecDeque::with_capacity(max_records + 1)),
            max_records,
        }
    }
}

impl DecisionStore for InMemoryDecisionStore {
    fn save(&self, artifact: AnalysisArtifact) {
        let mut artifacts = self.artifacts.write();
        artifacts.push_back(artifact);
        while artifacts.len() > self.max_records {
            artifacts.pop_front();
        }
    }

    fn recent(&self, count: usize) -> Vec<DecisionRecord> {
        let artifacts = self.artifacts.read();
        artifacts
            .iter()
            .rev()
            .take(count)
            .map(|a| a.record.clone())
            .collect()
    }

    fn last(&self) -> Option<AnalysisArtifact> {
        self.artifacts.read().back().cloned()
    }

    fn len(&self) -> usize {
        self.artifacts.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::decision::{AiAnalysis, DecisionMeta, HorizonPlan};
    use crate::types::Bias;
    use std::collections::HashMap;

    fn record(symbol: &str, ts: i64) -> AnalysisArtifact {
        let plan = HorizonPlan {
            bias: Bias::Neutral,
            confidence_pct: 50.0,
            entry_range: [99.0, 101.0],
            stop_loss: 97.0,
            targets: vec![105.0],
            rationale: String::new(),
        };
        AnalysisArtifact {
            candles: Vec::new(),
            agent_results: HashMap::new(),
            record: DecisionRecord {
                stock_symbol: symbol.to_string(),
                exchange: "NSE".into(),
                analysis_timestamp: ts,
                analysis_type: "full".into(),
                current_price: 100.0,
                ai_analysis: AiAnalysis {
                    trend: Bias::Neutral,
                    confidence_pct: 50.0,
                    short_term: plan.clone(),
                    medium_term: plan.clone(),
                    long_term: plan,
                    risks: vec!["r".into()],
                    must_watch_levels: vec![],
                    trading_strategy: String::new(),
                },
                signals: serde_json::json!({}),
                sector_context: serde_json::json!({}),
                mtf_context: serde_json::json!({}),
                meta: DecisionMeta::default(),
            },
        }
    }

    #[test]
    fn ring_trims_and_serves_newest_first() {
        let store = InMemoryDecisionStore::new(3);
        for i in 0..5 {
            store.save(record("ACME", i));
        }
        assert_eq!(store.len(), 3);
        let recent = store.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].analysis_timestamp, 4);
        assert_eq!(recent[2].analysis_timestamp, 2);
    }
}
