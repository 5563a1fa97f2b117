//! Structured representation of the dynamic model: stocks, parameters,
//! intermediates and derivatives.
//!
//! All structural edits happen on this representation rather than on formula
//! text. Removing a stock deletes the stock, its derivative and the
//! mechanically derived `inflow_<name>`/`outflow_<name>` intermediates; no
//! text surgery is ever performed.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::error::CoreError;

/// The four permanent base stocks. They may be refreshed but never deleted.
pub const BASE_STOCKS: [&str; 4] = ["S", "I", "R", "Rep"];

/// Identifiers that can never name a stock, parameter or intermediate.
pub const RESERVED_WORDS: [&str; 3] = ["t", "min", "max"];

/// An accumulating quantity integrated over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub name: String,
    pub initial: f64,
    pub description: String,
}

/// A per-run input with a default; never integrated, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub default: f64,
}

/// A named formula recomputed once per derivative evaluation. May reference
/// stocks, parameters and intermediates declared earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intermediate {
    pub name: String,
    pub formula: String,
}

/// The rate of change of one stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derivative {
    pub stock: String,
    pub formula: String,
}

/// The aggregate model: {stocks, parameters, intermediates, derivatives}.
///
/// Invariants (enforced by the mutation operations and re-checked by the
/// engine before commit):
/// - every stock has exactly one derivative;
/// - every identifier in a formula resolves to a stock, a parameter, an
///   earlier intermediate, or `t`;
/// - stock names are capitalized identifiers distinct from reserved words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub stocks: Vec<Stock>,
    pub parameters: Vec<Parameter>,
    pub intermediates: Vec<Intermediate>,
    pub derivatives: Vec<Derivative>,
}

impl ModelState {
    /// The baseline market-adoption model: market potential `S`, operations
    /// backlog `I`, revenue `R` and reputation `Rep`, with capacity
    /// saturation and a reputation drag on sales efficiency.
    pub fn baseline() -> Self {
        ModelState {
            stocks: vec![
                Stock {
                    name: "S".into(),
                    initial: 100.0,
                    description: "Untapped market potential".into(),
                },
                Stock {
                    name: "I".into(),
                    initial: 1.0,
                    description: "Active integrations (operations backlog)".into(),
                },
                Stock {
                    name: "R".into(),
                    initial: 0.0,
                    description: "Matured revenue".into(),
                },
                Stock {
                    name: "Rep".into(),
                    initial: 100.0,
                    description: "Strategic reputation".into(),
                },
            ],
            parameters: vec![
                Parameter { name: "S0".into(), default: 100.0 },
                Parameter { name: "beta".into(), default: 0.4 },
                Parameter { name: "gamma".into(), default: 0.1 },
                Parameter { name: "sigma".into(), default: 0.2 },
                Parameter { name: "capacity".into(), default: 40.0 },
            ],
            intermediates: vec![
                Intermediate { name: "N".into(), formula: "S0 + 1".into() },
                Intermediate {
                    name: "gamma_eff".into(),
                    formula: "I <= capacity ? gamma : gamma * (capacity / I)".into(),
                },
                Intermediate {
                    name: "reputation_drag".into(),
                    formula: "Rep < 50 ? 2 : 1".into(),
                },
                Intermediate {
                    name: "sigma_eff".into(),
                    formula: "min(sigma * reputation_drag, 0.95)".into(),
                },
                Intermediate {
                    name: "beta_eff".into(),
                    formula: "beta * (1 - sigma_eff)".into(),
                },
                Intermediate {
                    name: "adoption".into(),
                    formula: "beta_eff * S * I / N".into(),
                },
                Intermediate {
                    name: "revenue_flow".into(),
                    formula: "gamma_eff * I".into(),
                },
            ],
            derivatives: vec![
                Derivative { stock: "S".into(), formula: "-adoption".into() },
                Derivative {
                    stock: "I".into(),
                    formula: "adoption - revenue_flow".into(),
                },
                Derivative { stock: "R".into(), formula: "revenue_flow".into() },
                Derivative {
                    stock: "Rep".into(),
                    formula: "-0.05 * beta * I + 0.1 * (100 - Rep)".into(),
                },
            ],
        }
    }

    pub fn stock_names(&self) -> Vec<&str> {
        self.stocks.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stock_index(&self, name: &str) -> Option<usize> {
        self.stocks.iter().position(|s| s.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn intermediate(&self, name: &str) -> Option<&Intermediate> {
        self.intermediates.iter().find(|i| i.name == name)
    }

    pub fn derivative_of(&self, stock: &str) -> Option<&Derivative> {
        self.derivatives.iter().find(|d| d.stock == stock)
    }

    pub fn is_base_stock(name: &str) -> bool {
        BASE_STOCKS.contains(&name)
    }

    /// True if `name` already resolves to a stock, parameter, intermediate
    /// or reserved word.
    pub fn is_defined(&self, name: &str) -> bool {
        RESERVED_WORDS.contains(&name)
            || self.stock_index(name).is_some()
            || self.parameter(name).is_some()
            || self.intermediate(name).is_some()
    }

    /// Stock names must be capitalized identifiers: `[A-Z][A-Za-z0-9_]*`.
    pub fn is_valid_stock_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_uppercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn check_new_name(&self, name: &str) -> Result<(), CoreError> {
        if !Self::is_valid_stock_name(name) {
            return Err(CoreError::InvalidInput(format!(
                "`{name}` is not a valid stock name (capitalized identifier required)"
            )));
        }
        if self.is_defined(name) {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Names of the flow intermediates mechanically derived from a stock.
    pub fn flow_names(stock: &str) -> (String, String) {
        let lower = stock.to_lowercase();
        (format!("inflow_{lower}"), format!("outflow_{lower}"))
    }

    /// Adds a stock fed by an inflow/outflow pair. The derivative is
    /// synthesized as `max(-Name, inflow_name - outflow_name)`.
    ///
    /// The `max(-Name, ...)` positivity guard is a heuristic, not a proof of
    /// non-negativity under the integrator's stepping; the stability probe is
    /// the arbiter of whether the resulting model is accepted.
    pub fn add_stock_with_flows(
        &mut self,
        name: &str,
        initial: f64,
        description: &str,
        inflow: &str,
        outflow: &str,
    ) -> Result<(), CoreError> {
        self.check_new_name(name)?;
        let (inflow_name, outflow_name) = Self::flow_names(name);
        for flow in [&inflow_name, &outflow_name] {
            if self.is_defined(flow) {
                return Err(CoreError::DuplicateName(flow.clone()));
            }
        }
        self.stocks.push(Stock {
            name: name.to_string(),
            initial,
            description: description.to_string(),
        });
        self.intermediates.push(Intermediate {
            name: inflow_name.clone(),
            formula: inflow.to_string(),
        });
        self.intermediates.push(Intermediate {
            name: outflow_name.clone(),
            formula: outflow.to_string(),
        });
        self.derivatives.push(Derivative {
            stock: name.to_string(),
            formula: format!("max(-{name}, {inflow_name} - {outflow_name})"),
        });
        Ok(())
    }

    /// Adds a stock with a fully custom derivative formula.
    pub fn add_stock_with_derivative(
        &mut self,
        name: &str,
        initial: f64,
        description: &str,
        derivative: &str,
    ) -> Result<(), CoreError> {
        self.check_new_name(name)?;
        self.stocks.push(Stock {
            name: name.to_string(),
            initial,
            description: description.to_string(),
        });
        self.derivatives.push(Derivative {
            stock: name.to_string(),
            formula: derivative.to_string(),
        });
        Ok(())
    }

    /// Removes a stock, its derivative, and the intermediates mechanically
    /// named after it. Refuses for the permanent base stocks.
    pub fn remove_stock(&mut self, name: &str) -> Result<(), CoreError> {
        if Self::is_base_stock(name) {
            return Err(CoreError::ProtectedStock(name.to_string()));
        }
        if self.stock_index(name).is_none() {
            return Err(CoreError::UnknownName(name.to_string()));
        }
        let (inflow_name, outflow_name) = Self::flow_names(name);
        self.stocks.retain(|s| s.name != name);
        self.derivatives.retain(|d| d.stock != name);
        self.intermediates
            .retain(|i| i.name != inflow_name && i.name != outflow_name);
        Ok(())
    }

    /// Replaces an intermediate's formula, or appends a new intermediate at
    /// the end of the declaration order if the name is unknown.
    pub fn set_intermediate(&mut self, name: &str, formula: &str) -> Result<(), CoreError> {
        if self.stock_index(name).is_some() || self.parameter(name).is_some() {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        if let Some(existing) = self.intermediates.iter_mut().find(|i| i.name == name) {
            existing.formula = formula.to_string();
        } else {
            self.intermediates.push(Intermediate {
                name: name.to_string(),
                formula: formula.to_string(),
            });
        }
        Ok(())
    }

    /// Replaces the derivative of an existing stock.
    pub fn set_derivative(&mut self, stock: &str, formula: &str) -> Result<(), CoreError> {
        match self.derivatives.iter_mut().find(|d| d.stock == stock) {
            Some(existing) => {
                existing.formula = formula.to_string();
                Ok(())
            }
            None => Err(CoreError::UnknownName(stock.to_string())),
        }
    }

    /// Human-readable rendition of the whole model. This is the "formula
    /// text" echoed by runs and recorded in the version ledger; it is
    /// deterministic for a given model.
    pub fn formula_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# parameters");
        for p in &self.parameters {
            let _ = writeln!(out, "{} = {}", p.name, p.default);
        }
        let _ = writeln!(out, "# stocks");
        for s in &self.stocks {
            let _ = writeln!(out, "{} = {}  ({})", s.name, s.initial, s.description);
        }
        let _ = writeln!(out, "# flows");
        for i in &self.intermediates {
            let _ = writeln!(out, "{} = {}", i.name, i.formula);
        }
        let _ = writeln!(out, "# derivatives");
        for d in &self.derivatives {
            let _ = writeln!(out, "d({})/dt = {}", d.stock, d.formula);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_has_one_derivative_per_stock() {
        let model = ModelState::baseline();
        assert_eq!(model.stocks.len(), model.derivatives.len());
        for stock in &model.stocks {
            assert!(model.derivative_of(&stock.name).is_some());
        }
    }

    #[test]
    fn add_stock_with_flows_synthesizes_guarded_derivative() {
        let mut model = ModelState::baseline();
        model
            .add_stock_with_flows("Lobbying", 0.0, "Political influence", "0.10 * revenue_flow", "0.05 * Lobbying")
            .expect("add");
        let deriv = model.derivative_of("Lobbying").expect("derivative");
        assert_eq!(deriv.formula, "max(-Lobbying, inflow_lobbying - outflow_lobbying)");
        assert!(model.intermediate("inflow_lobbying").is_some());
        assert!(model.intermediate("outflow_lobbying").is_some());
    }

    #[test]
    fn add_stock_rejects_collisions_and_bad_names() {
        let mut model = ModelState::baseline();
        assert!(matches!(
            model.add_stock_with_derivative("R", 0.0, "", "0"),
            Err(CoreError::DuplicateName(_))
        ));
        assert!(matches!(
            model.add_stock_with_derivative("lobbying", 0.0, "", "0"),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            model.add_stock_with_derivative("Rep", 0.0, "", "0"),
            Err(CoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn remove_stock_refuses_base_stocks() {
        let mut model = ModelState::baseline();
        let before = model.clone();
        assert!(matches!(
            model.remove_stock("Rep"),
            Err(CoreError::ProtectedStock(_))
        ));
        assert_eq!(model, before);
    }

    #[test]
    fn remove_stock_deletes_derived_intermediates() {
        let mut model = ModelState::baseline();
        model
            .add_stock_with_flows("Lobbying", 0.0, "", "0.10 * revenue_flow", "0.05 * Lobbying")
            .expect("add");
        model.remove_stock("Lobbying").expect("remove");
        assert!(model.stock_index("Lobbying").is_none());
        assert!(model.derivative_of("Lobbying").is_none());
        assert!(model.intermediate("inflow_lobbying").is_none());
        assert!(model.intermediate("outflow_lobbying").is_none());
        assert_eq!(model, ModelState::baseline());
    }

    #[test]
    fn set_intermediate_upserts_and_protects_other_namespaces() {
        let mut model = ModelState::baseline();
        model.set_intermediate("revenue_flow", "gamma * I").expect("replace");
        assert_eq!(model.intermediate("revenue_flow").unwrap().formula, "gamma * I");
        model.set_intermediate("pressure", "sigma * I").expect("append");
        assert_eq!(model.intermediates.last().unwrap().name, "pressure");
        assert!(matches!(
            model.set_intermediate("S", "1"),
            Err(CoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn serde_round_trip_preserves_equality() {
        let model = ModelState::baseline();
        let json = serde_json::to_string(&model).expect("serialize");
        let back: ModelState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(model, back);
    }

    #[test]
    fn formula_text_is_deterministic() {
        let model = ModelState::baseline();
        assert_eq!(model.formula_text(), ModelState::baseline().formula_text());
        assert!(model.formula_text().contains("d(R)/dt = revenue_flow"));
    }
}
