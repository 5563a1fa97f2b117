use stockflow_core::error::CoreError;
use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Every variant is recoverable at the boundary of a single run/apply call:
/// the committed model is only ever replaced atomically on full success, so a
/// repeated sequence of failed edits leaves the engine in its last-known-good
/// state.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Formula or structural failure from the core (undefined identifier,
    /// dependency cycle, protected stock, unknown target, ...). Rejected
    /// before any state change.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The stability probe classified the tentative edit as unstable; the
    /// edit was discarded.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A malformed or unrepairable operation from the generation
    /// collaborator.
    #[error("operation rejected: {reason}")]
    OperationShape { reason: String },

    #[error("ledger I/O error: {0}")]
    LedgerIo(#[from] std::io::Error),

    #[error("ledger encoding error: {0}")]
    LedgerEncoding(#[from] serde_json::Error),
}

impl EngineError {
    pub fn shape(reason: impl Into<String>) -> Self {
        EngineError::OperationShape {
            reason: reason.into(),
        }
    }
}
