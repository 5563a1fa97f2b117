//! The model store: exclusive owner of the live [`ModelState`].
//!
//! Every mutating operation follows the same sequence: clone the committed
//! state, mutate the clone, run the semantic check, compile, run the
//! stability probe, and only then swap the clone in and append a version
//! record. Any failure along the way leaves the committed state untouched,
//! so mutations are atomic by construction.

use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};

use stockflow_core::compile::compile;
use stockflow_core::model::ModelState;
use stockflow_core::probe::probe;
use stockflow_core::solvers::{integrate, IntegrateOptions};

use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::ops::Operation;
use crate::semantic;

/// Parameters for a forecast run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Parameter overrides by name; missing parameters take model defaults.
    pub parameters: HashMap<String, f64>,
    pub t_max: f64,
    pub points: usize,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            parameters: HashMap::new(),
            t_max: 160.0,
            points: 200,
        }
    }
}

impl RunRequest {
    pub fn with_parameters(parameters: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            parameters: parameters.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// A forecast result: time grid, per-stock series keyed by lower-cased stock
/// name, and the formula text that produced it.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub times: Vec<f64>,
    pub series: BTreeMap<String, Vec<f64>>,
    pub formula_text: String,
}

impl RunResult {
    pub fn stock(&self, name: &str) -> Option<&[f64]> {
        self.series.get(&name.to_lowercase()).map(Vec::as_slice)
    }
}

/// Owns the committed model and its baseline snapshot.
pub struct ModelStore {
    state: ModelState,
    baseline: ModelState,
    ledger: Ledger,
}

impl ModelStore {
    pub fn new(ledger: Ledger) -> Self {
        let state = ModelState::baseline();
        Self {
            baseline: state.clone(),
            state,
            ledger,
        }
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn formula_text(&self) -> String {
        self.state.formula_text()
    }

    /// Full ModelState as structured text; parses back to an equal state.
    pub fn state_text(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(&self.state)?)
    }

    /// Integrates the committed model. Never mutates state; concurrent runs
    /// against the same committed state are safe.
    pub fn run(&self, request: &RunRequest) -> Result<RunResult, EngineError> {
        let compiled = compile(&self.state, &request.parameters)?;
        let grid: Vec<f64> = (0..request.points)
            .map(|i| request.t_max * i as f64 / (request.points.saturating_sub(1)).max(1) as f64)
            .collect();
        let mut trajectory = integrate(
            &compiled,
            compiled.initials(),
            &grid,
            &IntegrateOptions::default(),
        )?;

        // Clip to twice the market size. A numerical safety valve inherited
        // from the reference behavior: it masks unbounded growth in an
        // already-committed model instead of failing the run. The stability
        // probe is what actually rejects explosive edits.
        let market_size = request
            .parameters
            .get("S0")
            .copied()
            .or_else(|| self.state.parameter("S0").map(|p| p.default))
            .unwrap_or(100.0);
        trajectory.clip(2.0 * market_size);

        let mut series = BTreeMap::new();
        for (idx, name) in compiled.stock_names().iter().enumerate() {
            series.insert(name.to_lowercase(), trajectory.column(idx));
        }
        Ok(RunResult {
            times: trajectory.times,
            series,
            formula_text: self.state.formula_text(),
        })
    }

    /// Applies one already-normalized operation: tentative apply, semantic
    /// check, compile, stability probe, then commit + ledger append. On any
    /// failure the committed state is left untouched.
    pub fn apply(&mut self, op: &Operation) -> Result<String, EngineError> {
        let mut candidate = self.state.clone();
        apply_to(&mut candidate, op)?;
        semantic::check(&candidate)?;

        let verdict = probe(&candidate)?;
        if !verdict.is_stable() {
            warn!(operation = ?op, %verdict, "edit rejected by stability probe");
            return Err(EngineError::Validation {
                reason: verdict.to_string(),
            });
        }

        self.state = candidate;
        self.ledger.append(&self.state)?;
        info!(operation = ?op, "edit committed");
        Ok(self.state.formula_text())
    }

    /// Restores the baseline snapshot verbatim and records the restoration
    /// as a committed version.
    pub fn reset_to_baseline(&mut self) -> Result<String, EngineError> {
        self.state = self.baseline.clone();
        self.ledger.append(&self.state)?;
        info!("model reset to baseline");
        Ok(self.state.formula_text())
    }
}

fn apply_to(model: &mut ModelState, op: &Operation) -> Result<(), EngineError> {
    match op {
        Operation::AddStock {
            name,
            initial,
            description,
            inflow,
            outflow,
            derivative,
        } => match (inflow, outflow, derivative) {
            (_, _, Some(derivative)) => {
                model.add_stock_with_derivative(name, *initial, description, derivative)?
            }
            (Some(inflow), Some(outflow), None) => {
                model.add_stock_with_flows(name, *initial, description, inflow, outflow)?
            }
            _ => {
                return Err(EngineError::shape(format!(
                    "add_stock `{name}` needs either a derivative or an inflow/outflow pair"
                )))
            }
        },
        Operation::ModifyIntermediate { name, formula } => {
            model.set_intermediate(name, formula)?
        }
        Operation::ModifyDerivative { stock, formula } => model.set_derivative(stock, formula)?,
        Operation::RemoveStock { name } => model.remove_stock(name)?,
    }
    Ok(())
}
