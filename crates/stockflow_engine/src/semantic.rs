//! Semantic validation of a candidate model.
//!
//! The patch normalizer repairs individual operations; this companion check
//! runs on the whole candidate model after the tentative apply and before the
//! stability probe. It enforces the structural contract the formula compiler
//! cannot see on its own: every stock carries exactly one derivative, no
//! derivative dangles, and a flow-fed stock keeps its positivity guard.
//! A violation rejects the whole patch; there are no partial applies.

use std::collections::HashSet;

use stockflow_core::formula::{parse, Expr, Func};
use stockflow_core::model::ModelState;

use crate::error::EngineError;

/// Checks model-level invariants the compiler does not cover.
pub fn check(model: &ModelState) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for deriv in &model.derivatives {
        if !seen.insert(deriv.stock.as_str()) {
            return Err(EngineError::shape(format!(
                "stock `{}` has more than one derivative",
                deriv.stock
            )));
        }
        if model.stock_index(&deriv.stock).is_none() {
            return Err(EngineError::shape(format!(
                "derivative for `{}` has no matching stock",
                deriv.stock
            )));
        }
    }
    for stock in &model.stocks {
        if !seen.contains(stock.name.as_str()) {
            return Err(EngineError::shape(format!(
                "stock `{}` has no derivative",
                stock.name
            )));
        }
    }

    let mut inter_seen = HashSet::new();
    for inter in &model.intermediates {
        if !inter_seen.insert(inter.name.as_str()) {
            return Err(EngineError::shape(format!(
                "intermediate `{}` is declared twice",
                inter.name
            )));
        }
    }

    for stock in &model.stocks {
        let (inflow_name, outflow_name) = ModelState::flow_names(&stock.name);
        let flow_fed = model.intermediate(&inflow_name).is_some()
            && model.intermediate(&outflow_name).is_some();
        if !flow_fed {
            continue;
        }
        // derivative_of cannot fail here: every stock was matched above.
        let deriv = model
            .derivative_of(&stock.name)
            .ok_or_else(|| EngineError::shape(format!("stock `{}` has no derivative", stock.name)))?;
        if !has_positivity_guard(&deriv.formula, &stock.name) {
            return Err(EngineError::shape(format!(
                "derivative of flow-fed stock `{}` lost its `max(-{}, ...)` positivity guard",
                stock.name, stock.name
            )));
        }
    }

    Ok(())
}

/// True if the formula has the shape `max(-Stock, ...)` at its root.
///
/// The guard is a heuristic against negative drift, not a proof of
/// non-negativity under the integrator's stepping; the stability probe stays
/// the final arbiter.
fn has_positivity_guard(formula: &str, stock: &str) -> bool {
    let Ok(expr) = parse(formula) else {
        return false;
    };
    match expr {
        Expr::Call(Func::Max, first, _) => match *first {
            Expr::Neg(inner) => matches!(&*inner, Expr::Ident(name) if name == stock),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::model::Derivative;

    #[test]
    fn baseline_passes() {
        check(&ModelState::baseline()).expect("baseline is well-formed");
    }

    #[test]
    fn flow_fed_stock_passes_with_guard() {
        let mut model = ModelState::baseline();
        model
            .add_stock_with_flows("Lobbying", 0.0, "", "0.10 * revenue_flow", "0.05 * Lobbying")
            .expect("add");
        check(&model).expect("guarded flow-fed stock is well-formed");
    }

    #[test]
    fn missing_derivative_is_rejected() {
        let mut model = ModelState::baseline();
        model.derivatives.retain(|d| d.stock != "R");
        let err = check(&model).expect_err("must reject");
        assert!(err.to_string().contains("no derivative"));
    }

    #[test]
    fn duplicate_derivative_is_rejected() {
        let mut model = ModelState::baseline();
        model.derivatives.push(Derivative {
            stock: "R".into(),
            formula: "0".into(),
        });
        let err = check(&model).expect_err("must reject");
        assert!(err.to_string().contains("more than one derivative"));
    }

    #[test]
    fn dangling_derivative_is_rejected() {
        let mut model = ModelState::baseline();
        model.derivatives.push(Derivative {
            stock: "Ghost".into(),
            formula: "0".into(),
        });
        let err = check(&model).expect_err("must reject");
        assert!(err.to_string().contains("no matching stock"));
    }

    #[test]
    fn stripped_positivity_guard_is_rejected() {
        let mut model = ModelState::baseline();
        model
            .add_stock_with_flows("Lobbying", 0.0, "", "0.10 * revenue_flow", "0.05 * Lobbying")
            .expect("add");
        model
            .set_derivative("Lobbying", "inflow_lobbying - outflow_lobbying")
            .expect("set");
        let err = check(&model).expect_err("must reject");
        assert!(err.to_string().contains("positivity guard"));
    }

    #[test]
    fn guard_shape_is_structural_not_textual() {
        assert!(has_positivity_guard(
            "max( -Lobbying , inflow_lobbying - outflow_lobbying )",
            "Lobbying"
        ));
        assert!(!has_positivity_guard(
            "max(-Other, inflow_lobbying - outflow_lobbying)",
            "Lobbying"
        ));
        assert!(!has_positivity_guard("min(-Lobbying, 0)", "Lobbying"));
    }
}
