// =============================================================================
// Specialist Analyzers
// =============================================================================
//
// The closed set of analyzer implementations. Every analyzer is
// self-contained: it reads the shared inputs bundle, produces a structured
// payload, and owns any LLM calls it makes.
// =============================================================================

pub mod insight;
pub mod ml;
pub mod patterns;
pub mod sector;
pub mod technical;
pub mod volume;
