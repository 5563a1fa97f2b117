//! Patch normalization.
//!
//! Operations produced by the generation collaborator routinely violate the
//! engine's naming and stock/flow conventions. Instead of rejecting on the
//! first mismatch, this module deterministically repairs the known classes
//! of violation and reports every repair it made. Anything it cannot repair
//! mechanically rejects the whole operation.

use std::fmt;

use regex::Regex;
use tracing::debug;

use crate::error::EngineError;
use crate::ops::Operation;

/// A single repair applied during normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    pub rule: RepairRule,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairRule {
    /// Stock name trimmed / canonicalized to capitalized form, renamed
    /// consistently across all formula fields.
    NameNormalized,
    /// An inflow fed by the accumulated revenue stock was rewritten to
    /// reference the revenue flow instead.
    StockFlowSubstitution,
    /// An outflow that never referenced the stock itself was replaced by a
    /// linear decay.
    OutflowSynthesized,
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = match self.rule {
            RepairRule::NameNormalized => "name-normalized",
            RepairRule::StockFlowSubstitution => "stock-vs-flow",
            RepairRule::OutflowSynthesized => "outflow-synthesized",
        };
        write!(f, "[{rule}] {}", self.detail)
    }
}

/// An operation the model store will accept, plus the repairs that got it
/// there.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOperation {
    pub operation: Operation,
    pub repairs: Vec<Repair>,
}

/// The revenue flow term substituted for references to the accumulated
/// revenue stock `R` in inflow expressions. New stocks are fed by rates, not
/// by other stocks' totals.
const REVENUE_FLOW_TERM: &str = "(gamma * I)";
const REVENUE_STOCK: &str = "R";
const DEFAULT_DECAY_COEFFICIENT: &str = "0.05";

/// Normalizes an externally produced operation, or rejects it as
/// unrepairable.
pub fn normalize(op: Operation) -> Result<NormalizedOperation, EngineError> {
    let mut repairs = Vec::new();
    let operation = match op {
        Operation::AddStock {
            name,
            initial,
            description,
            inflow,
            outflow,
            derivative,
        } => {
            let name = canonical_stock_name(&name, &mut repairs)?;
            let inflow = name.fix_formula(inflow, &mut repairs);
            let outflow = name.fix_formula(outflow, &mut repairs);
            let derivative = name.fix_formula(derivative, &mut repairs);
            normalize_add_stock(
                name.canonical,
                initial,
                description,
                inflow,
                outflow,
                derivative,
                &mut repairs,
            )?
        }
        Operation::ModifyIntermediate { name, formula } => Operation::ModifyIntermediate {
            name: valid_identifier(name.trim())?,
            formula: formula.trim().to_string(),
        },
        Operation::ModifyDerivative { stock, formula } => {
            let stock = canonical_stock_name(&stock, &mut repairs)?;
            let formula = stock
                .fix_formula(Some(formula), &mut repairs)
                .unwrap_or_default();
            Operation::ModifyDerivative {
                stock: stock.canonical,
                formula,
            }
        }
        Operation::RemoveStock { name } => Operation::RemoveStock {
            name: canonical_stock_name(&name, &mut repairs)?.canonical,
        },
    };

    for repair in &repairs {
        debug!(%repair, "normalizer repaired operation");
    }
    Ok(NormalizedOperation { operation, repairs })
}

#[allow(clippy::too_many_arguments)]
fn normalize_add_stock(
    name: String,
    initial: f64,
    description: String,
    inflow: Option<String>,
    outflow: Option<String>,
    derivative: Option<String>,
    repairs: &mut Vec<Repair>,
) -> Result<Operation, EngineError> {
    if let Some(derivative) = derivative.filter(|d| !d.is_empty()) {
        return Ok(Operation::AddStock {
            name,
            initial,
            description,
            inflow: None,
            outflow: None,
            derivative: Some(derivative),
        });
    }

    let inflow = match inflow.filter(|f| !f.is_empty()) {
        Some(f) => f,
        None => {
            return Err(EngineError::shape(format!(
                "add_stock `{name}` carries neither a derivative nor an inflow"
            )))
        }
    };

    // Stock-vs-flow: feed new stocks from the revenue *rate*, never from the
    // accumulated revenue stock.
    let inflow = if references(&inflow, REVENUE_STOCK, false) {
        let rewritten = replace_identifier(&inflow, REVENUE_STOCK, REVENUE_FLOW_TERM, false);
        repairs.push(Repair {
            rule: RepairRule::StockFlowSubstitution,
            detail: format!(
                "inflow referenced accumulated stock `{REVENUE_STOCK}`; \
                 rewrote to flow term `{REVENUE_FLOW_TERM}`"
            ),
        });
        rewritten
    } else {
        inflow
    };

    // Outflow guarantee: without a self-referencing outflow the stock has no
    // way back down, so synthesize a linear decay.
    let outflow = match outflow.filter(|f| !f.is_empty()) {
        Some(f) if references(&f, &name, true) => f,
        other => {
            let coefficient = other
                .as_deref()
                .and_then(first_numeric_literal)
                .unwrap_or_else(|| DEFAULT_DECAY_COEFFICIENT.to_string());
            let synthesized = format!("{coefficient} * {name}");
            repairs.push(Repair {
                rule: RepairRule::OutflowSynthesized,
                detail: match other {
                    Some(f) => format!(
                        "outflow `{f}` never references `{name}`; replaced with `{synthesized}`"
                    ),
                    None => format!("missing outflow; synthesized `{synthesized}`"),
                },
            });
            synthesized
        }
    };

    Ok(Operation::AddStock {
        name,
        initial,
        description,
        inflow: Some(inflow),
        outflow: Some(outflow),
        derivative: None,
    })
}

/// A stock name after trimming and capitalization.
struct CanonicalName {
    canonical: String,
}

impl CanonicalName {
    /// Recases every reference to the stock, whatever casing the formula
    /// used, to the canonical name. Identifiers are case-significant, so a
    /// mismatched reference would otherwise fail compilation even when the
    /// stock name itself needed no repair.
    fn fix_formula(
        &self,
        formula: Option<String>,
        repairs: &mut Vec<Repair>,
    ) -> Option<String> {
        formula.map(|f| {
            let f = f.trim().to_string();
            let fixed = replace_identifier(&f, &self.canonical, &self.canonical, true);
            if fixed != f {
                repairs.push(Repair {
                    rule: RepairRule::NameNormalized,
                    detail: format!("`{f}` recased to `{fixed}`"),
                });
            }
            fixed
        })
    }
}

/// Trims and capitalizes a stock name; records a repair if anything changed.
fn canonical_stock_name(
    raw: &str,
    repairs: &mut Vec<Repair>,
) -> Result<CanonicalName, EngineError> {
    let trimmed = valid_identifier(raw.trim())?;
    let mut chars = trimmed.chars();
    let first = chars
        .next()
        .ok_or_else(|| EngineError::shape("empty stock name"))?;
    let canonical: String = first.to_ascii_uppercase().to_string() + chars.as_str();

    if canonical != raw {
        repairs.push(Repair {
            rule: RepairRule::NameNormalized,
            detail: format!("`{raw}` canonicalized to `{canonical}`"),
        });
    }
    Ok(CanonicalName { canonical })
}

fn valid_identifier(name: &str) -> Result<String, EngineError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(EngineError::shape(format!(
            "`{name}` is not a usable identifier"
        )));
    }
    Ok(name.to_string())
}

/// Whole-identifier regex for `ident`, optionally case-insensitive.
fn identifier_pattern(ident: &str, case_insensitive: bool) -> Regex {
    let flag = if case_insensitive { "(?i)" } else { "" };
    let pattern = format!(r"{flag}\b{}\b", regex::escape(ident));
    // Built from an escaped identifier; always compiles.
    Regex::new(&pattern).expect("identifier pattern")
}

fn references(formula: &str, ident: &str, case_insensitive: bool) -> bool {
    identifier_pattern(ident, case_insensitive).is_match(formula)
}

fn replace_identifier(formula: &str, from: &str, to: &str, case_insensitive: bool) -> String {
    identifier_pattern(from, case_insensitive)
        .replace_all(formula, to)
        .into_owned()
}

fn first_numeric_literal(formula: &str) -> Option<String> {
    let re = Regex::new(r"\d+\.?\d*|\.\d+").expect("numeric literal pattern");
    re.find(formula).map(|m| m.as_str().to_string())
}
