//! The engine façade.
//!
//! [`Engine`] wraps the [`ModelStore`] behind an `RwLock` so forecast runs
//! can proceed concurrently while mutations serialize. It also hosts the
//! generation boundary: an [`OperationSource`] proposes structured
//! operations from natural-language requests, and the engine normalizes,
//! validates, and (on a rejected first attempt) retries exactly once with
//! the failure fed back into the request context.

use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::normalize::{normalize, Repair};
use crate::ops::{operation_catalog, Operation};
use crate::store::{ModelStore, RunRequest, RunResult};

/// Produces one structured [`Operation`] for a natural-language edit
/// request, given the current formula text and the operation catalog.
pub trait OperationSource {
    fn propose(
        &self,
        model_text: &str,
        catalog: &str,
        request: &str,
    ) -> anyhow::Result<Operation>;
}

/// Outcome of a committed edit: the new formula text plus any repairs the
/// normalizer applied on the way in.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub formula_text: String,
    pub repairs: Vec<Repair>,
}

/// Thread-safe façade over the model store.
pub struct Engine {
    store: RwLock<ModelStore>,
}

impl Engine {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            store: RwLock::new(ModelStore::new(ledger)),
        }
    }

    /// Runs a forecast against the committed model under a read lock.
    pub fn run(&self, request: &RunRequest) -> Result<RunResult, EngineError> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .run(request)
    }

    /// Normalizes and applies one structured operation under a write lock.
    pub fn apply_operation(&self, op: Operation) -> Result<ApplyOutcome, EngineError> {
        let normalized = normalize(op)?;
        if !normalized.repairs.is_empty() {
            debug!(repairs = ?normalized.repairs, "normalizer repaired operation");
        }
        let formula_text = self
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&normalized.operation)?;
        Ok(ApplyOutcome {
            formula_text,
            repairs: normalized.repairs,
        })
    }

    /// Turns a natural-language request into an operation via `source` and
    /// applies it. A rejected or malformed first proposal earns exactly one
    /// retry, with the failure appended to the request context; the second
    /// failure is final.
    pub fn apply_generated(
        &self,
        source: &dyn OperationSource,
        request: &str,
    ) -> Result<ApplyOutcome, EngineError> {
        let model_text = self.formula_text();
        let catalog = operation_catalog();

        let first = self.propose_and_apply(source, &model_text, catalog, request);
        let err = match first {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        warn!(%err, "first proposal rejected, retrying once");
        let amended = format!(
            "{request}\n\nYour previous operation was rejected: {err}. \
             Propose a corrected operation."
        );
        self.propose_and_apply(source, &model_text, catalog, &amended)
    }

    fn propose_and_apply(
        &self,
        source: &dyn OperationSource,
        model_text: &str,
        catalog: &str,
        request: &str,
    ) -> Result<ApplyOutcome, EngineError> {
        let op = source
            .propose(model_text, catalog, request)
            .map_err(|e| EngineError::shape(format!("operation source failed: {e}")))?;
        self.apply_operation(op)
    }

    /// Restores the baseline model.
    pub fn reset(&self) -> Result<String, EngineError> {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_to_baseline()
    }

    pub fn formula_text(&self) -> String {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .formula_text()
    }

    pub fn state_text(&self) -> Result<String, EngineError> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state_text()
    }

    /// Number of committed versions this engine has recorded.
    pub fn version_count(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ledger()
            .records()
            .len()
    }
}
