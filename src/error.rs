// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Every failure that crosses the request boundary is reduced to one of these
// variants. Each carries a stable machine-readable `kind` string for the wire
// plus a human message; the pipeline never surfaces an opaque error to a
// client.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The market data provider returned nothing usable. Hard failure.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// Invalid symbol/options from the client. Never reaches the analyzers.
    #[error("invalid request: {0}")]
    Client(String),

    /// The pending-analysis queue is full. Retryable.
    #[error("analysis queue is full, retry later")]
    Busy,

    /// The request was cancelled (client disconnect or deadline). No
    /// decision is emitted for a cancelled request.
    #[error("request cancelled")]
    Cancelled,

    /// The overall request deadline elapsed before synthesis completed.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// All language-model retries and the fallback tier were exhausted in a
    /// path where no deterministic fallback exists.
    #[error("language model failure: {0}")]
    Llm(String),

    /// Anything else internal; the message is already sanitised.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable wire identifier for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DataUnavailable(_) => "data_unavailable",
            EngineError::Client(_) => "client_error",
            EngineError::Busy => "busy",
            EngineError::Cancelled => "cancelled",
            EngineError::Timeout(_) => "timeout",
            EngineError::Llm(_) => "llm_failure",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether a client may retry the identical request.
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::Busy | EngineError::Timeout(_))
    }
}
