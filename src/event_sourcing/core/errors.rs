use crate::utils::IsTransient;

// ============================================================================
// Engine Errors
// ============================================================================
//
// One taxonomy for the whole engine. Backend I/O failures travel through
// `Backend` untouched; the engine never retries on its own.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or unrepresentable payload, or a cyclic type shape
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored event type is no longer known to this deployment
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Another writer already took this sequence number
    #[error("Concurrency conflict on {aggregate_type}/{aggregate_id}: sequence {sequence} already taken")]
    ConcurrencyConflict {
        aggregate_id: String,
        aggregate_type: String,
        sequence: u64,
    },

    /// Caller tried to append past the stream head
    #[error("Sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// Duplicate handler, invalid threshold, missing handler under a strict policy
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl IsTransient for EngineError {
    fn is_transient(&self) -> bool {
        self.is_concurrency_conflict()
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
