use thiserror::Error;

/// Errors produced while compiling or integrating a model.
///
/// Everything here is recoverable at the boundary of a single call: a failed
/// compile or a non-convergent integration never touches committed state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("formula parse error: {0}")]
    Parse(String),

    #[error("undefined identifier `{0}` in formula")]
    UndefinedIdentifier(String),

    #[error("intermediate `{0}` referenced before its declaration (dependency cycle)")]
    ForwardReference(String),

    #[error("name `{0}` is already defined")]
    DuplicateName(String),

    #[error("`{0}` is a permanent base stock and cannot be removed")]
    ProtectedStock(String),

    #[error("no model element named `{0}`")]
    UnknownName(String),

    #[error("stock `{0}` has no derivative")]
    MissingDerivative(String),

    #[error("integration did not converge: {0}")]
    NonConvergent(String),

    #[error("{0}")]
    InvalidInput(String),
}
