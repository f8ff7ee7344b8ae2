// =============================================================================
// Analysis Orchestration Engine
// =============================================================================
//
// registry/executor fan out the specialist analyzers; the MTF aggregator
// repeats the core subset across timeframes; the context builder composes a
// bounded document; the synthesizer turns it into one validated decision.
// =============================================================================

pub mod agent;
pub mod agents;
pub mod context;
pub mod decision;
pub mod executor;
pub mod levels;
pub mod mtf;
pub mod orchestrator;
pub mod registry;
pub mod synthesizer;

pub use agent::{AgentResult, AgentStatus, AnalysisInputs, Analyzer, AnalyzerSpec};
pub use decision::{Decision, DecisionRecord};
pub use registry::AnalyzerRegistry;
