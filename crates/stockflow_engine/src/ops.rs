//! Structured edit operations.
//!
//! An [`Operation`] is the only way an external caller (or the generation
//! collaborator) can change the model. It is ephemeral: it exists for the
//! duration of a single apply attempt and is never stored.

use serde::{Deserialize, Serialize};

/// A proposed structural edit to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Adds a stock. Either `inflow`/`outflow` (the derivative is then
    /// synthesized with a positivity guard) or a full `derivative` formula.
    AddStock {
        name: String,
        #[serde(default)]
        initial: f64,
        #[serde(default)]
        description: String,
        #[serde(default)]
        inflow: Option<String>,
        #[serde(default)]
        outflow: Option<String>,
        #[serde(default)]
        derivative: Option<String>,
    },
    /// Replaces (or introduces) a named intermediate formula.
    ModifyIntermediate { name: String, formula: String },
    /// Replaces the derivative of an existing stock.
    ModifyDerivative { stock: String, formula: String },
    /// Removes a non-base stock together with its derivative and derived
    /// flow intermediates.
    RemoveStock { name: String },
}

impl Operation {
    /// The target element this operation names.
    pub fn target(&self) -> &str {
        match self {
            Operation::AddStock { name, .. } => name,
            Operation::ModifyIntermediate { name, .. } => name,
            Operation::ModifyDerivative { stock, .. } => stock,
            Operation::RemoveStock { name } => name,
        }
    }
}

/// The fixed catalog of operation shapes exposed to the generation
/// collaborator. The collaborator must return exactly one operation object
/// matching one of these shapes per request.
pub fn operation_catalog() -> &'static str {
    r#"Allowed operations (return exactly one JSON object):

{"kind": "add_stock", "name": "<CapitalizedName>", "initial": <number>,
 "description": "<text>", "inflow": "<formula>", "outflow": "<formula>"}
{"kind": "add_stock", "name": "<CapitalizedName>", "initial": <number>,
 "description": "<text>", "derivative": "<formula>"}
{"kind": "modify_intermediate", "name": "<identifier>", "formula": "<formula>"}
{"kind": "modify_derivative", "stock": "<CapitalizedName>", "formula": "<formula>"}
{"kind": "remove_stock", "name": "<CapitalizedName>"}

Formulas use arithmetic (+ - * /), comparisons, `cond ? a : b`, min(a, b),
max(a, b), numeric literals and identifiers already defined in the model.
New stocks must be fed by flow terms (rates), not by other stocks'
accumulated totals."#
}
