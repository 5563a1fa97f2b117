//! Stability probe: a short stress simulation that classifies a candidate
//! model as stable or unstable before the engine commits it.
//!
//! The probe deliberately ignores the model's real initial values and the
//! caller's parameters: every stock starts at 1.0 and demand aggressiveness
//! is pushed above baseline. A model that survives this profile without
//! exploding or drifting negative is accepted. The probe never clips.

use std::collections::HashMap;
use std::fmt;

use crate::compile::compile;
use crate::error::CoreError;
use crate::model::ModelState;
use crate::solvers::{integrate, IntegrateOptions};

/// Any magnitude above this at any probe time point is an explosion.
pub const EXPLOSION_THRESHOLD: f64 = 5000.0;

/// Tolerates tiny negative floating error but not sustained negative stocks.
pub const NEGATIVE_TOLERANCE: f64 = -0.1;

/// Probe horizon in simulation time units.
pub const PROBE_HORIZON: f64 = 40.0;

/// Number of grid points on the probe horizon.
pub const PROBE_POINTS: usize = 50;

/// Stress overrides applied on top of the model's parameter defaults.
const STRESS_PROFILE: [(&str, f64); 3] = [("S0", 100.0), ("beta", 1.5), ("gamma", 0.1)];

/// Outcome of a probe run.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Stable,
    /// A value's magnitude exceeded [`EXPLOSION_THRESHOLD`].
    Explosive { stock: String, t: f64, value: f64 },
    /// A value dropped below [`NEGATIVE_TOLERANCE`].
    NegativeDrift { stock: String, t: f64, value: f64 },
    /// The integrator refused to converge within its step ceiling.
    NonConvergent { reason: String },
}

impl Verdict {
    pub fn is_stable(&self) -> bool {
        matches!(self, Verdict::Stable)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Stable => write!(f, "stable"),
            Verdict::Explosive { stock, t, value } => write!(
                f,
                "numerical explosion: |{stock}| reached {value:.1} at t = {t:.1} \
                 (unbounded positive loop)"
            ),
            Verdict::NegativeDrift { stock, t, value } => write!(
                f,
                "negative drift: {stock} fell to {value:.3} at t = {t:.1}"
            ),
            Verdict::NonConvergent { reason } => {
                write!(f, "integrator did not converge: {reason}")
            }
        }
    }
}

/// Runs the stress probe against `model`.
///
/// Compile failures propagate as errors (the caller rejects the edit before
/// any simulation); integration failures are a [`Verdict::NonConvergent`]
/// classification, not an error.
pub fn probe(model: &ModelState) -> Result<Verdict, CoreError> {
    let overrides: HashMap<String, f64> = STRESS_PROFILE
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
    let compiled = compile(model, &overrides)?;

    let y0 = vec![1.0; compiled.stock_names().len()];
    let grid: Vec<f64> = (0..PROBE_POINTS)
        .map(|i| PROBE_HORIZON * i as f64 / (PROBE_POINTS - 1) as f64)
        .collect();
    // Coarse tolerances: the probe is a classifier, not a forecast.
    let opts = IntegrateOptions {
        rtol: 1e-4,
        atol: 1e-7,
        max_steps: 20_000,
        ..Default::default()
    };

    let traj = match integrate(&compiled, &y0, &grid, &opts) {
        Ok(traj) => traj,
        Err(CoreError::NonConvergent(reason)) => {
            return Ok(Verdict::NonConvergent { reason });
        }
        Err(other) => return Err(other),
    };

    for row in 0..traj.values.nrows() {
        for (col, name) in compiled.stock_names().iter().enumerate() {
            let value = traj.values[(row, col)];
            if value.abs() > EXPLOSION_THRESHOLD {
                return Ok(Verdict::Explosive {
                    stock: name.clone(),
                    t: traj.times[row],
                    value,
                });
            }
            if value < NEGATIVE_TOLERANCE {
                return Ok(Verdict::NegativeDrift {
                    stock: name.clone(),
                    t: traj.times[row],
                    value,
                });
            }
        }
    }
    Ok(Verdict::Stable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_model_is_stable() {
        let verdict = probe(&ModelState::baseline()).expect("probe");
        assert_eq!(verdict, Verdict::Stable);
    }

    #[test]
    fn exponential_revenue_is_explosive() {
        let mut model = ModelState::baseline();
        // e^(0.5 * 40) from R = 1 passes 5000 well inside the horizon.
        model.set_derivative("R", "0.5 * R").expect("set");
        let verdict = probe(&model).expect("probe");
        match verdict {
            Verdict::Explosive { stock, .. } => assert_eq!(stock, "R"),
            other => panic!("expected explosive verdict, got {other:?}"),
        }
    }

    #[test]
    fn constant_drain_is_negative_drift() {
        let mut model = ModelState::baseline();
        model.set_derivative("R", "-1").expect("set");
        let verdict = probe(&model).expect("probe");
        match verdict {
            Verdict::NegativeDrift { stock, .. } => assert_eq!(stock, "R"),
            other => panic!("expected negative drift verdict, got {other:?}"),
        }
    }

    #[test]
    fn finite_time_blowup_is_nonconvergent_not_a_panic() {
        let mut model = ModelState::baseline();
        model.set_derivative("R", "R * R * R").expect("set");
        let verdict = probe(&model).expect("probe");
        assert!(
            matches!(
                verdict,
                Verdict::NonConvergent { .. } | Verdict::Explosive { .. }
            ),
            "got {verdict:?}"
        );
        assert!(!verdict.is_stable());
    }

    #[test]
    fn compile_failure_propagates_as_error() {
        let mut model = ModelState::baseline();
        model.set_derivative("R", "ghost_flow").expect("set");
        let err = probe(&model).expect_err("must be a compile error");
        assert_eq!(err, CoreError::UndefinedIdentifier("ghost_flow".into()));
    }

    #[test]
    fn verdict_reasons_are_human_readable() {
        let verdict = Verdict::Explosive {
            stock: "R".into(),
            t: 12.0,
            value: 6000.0,
        };
        let text = verdict.to_string();
        assert!(text.contains("explosion"));
        assert!(text.contains('R'));
    }
}
