//! Lowers a [`ModelState`] into an evaluable derivative function.
//!
//! Compilation resolves every identifier to a slot-indexed load and fixes the
//! evaluation order: stocks are read from the state vector, intermediates are
//! computed in declaration order, then derivatives are evaluated in stock
//! declaration order. An intermediate referencing one declared at or after
//! itself is rejected: declaration order is the dependency order, so any
//! cycle surfaces as a forward reference.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::CoreError;
use crate::formula::{parse, BinOp, Expr, Func};
use crate::model::ModelState;
use crate::traits::DynamicalSystem;
use crate::vm::{Bytecode, OpCode, Vm};

/// Resolves identifiers to slot indices and lowers ASTs to bytecode.
pub struct Compiler {
    var_map: HashMap<String, usize>,
    param_map: HashMap<String, usize>,
    inter_map: HashMap<String, usize>,
    /// All intermediate names, for distinguishing a forward reference from a
    /// genuinely undefined identifier.
    all_inters: Vec<String>,
}

impl Compiler {
    pub fn new(stock_names: &[&str], param_names: &[&str], inter_names: &[&str]) -> Self {
        let var_map = stock_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        Self {
            var_map,
            param_map,
            inter_map: HashMap::new(),
            all_inters: inter_names.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Marks an intermediate as computed, making it referenceable by later
    /// formulas.
    pub fn define_intermediate(&mut self, name: &str) {
        let idx = self.inter_map.len();
        self.inter_map.insert(name.to_string(), idx);
    }

    pub fn compile_str(&self, formula: &str) -> Result<Bytecode, CoreError> {
        let expr = parse(formula).map_err(CoreError::Parse)?;
        self.compile(&expr)
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, CoreError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), CoreError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Ident(name) => ops.push(self.resolve(name)?),
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Div => OpCode::Div,
                    BinOp::Lt => OpCode::Lt,
                    BinOp::Le => OpCode::Le,
                    BinOp::Gt => OpCode::Gt,
                    BinOp::Ge => OpCode::Ge,
                    BinOp::Eq => OpCode::Eq,
                    BinOp::Ne => OpCode::Ne,
                });
            }
            Expr::Neg(inner) => {
                self.compile_recursive(inner, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Ternary(cond, then, els) => {
                self.compile_recursive(cond, ops)?;
                self.compile_recursive(then, ops)?;
                self.compile_recursive(els, ops)?;
                ops.push(OpCode::Select);
            }
            Expr::Call(func, a, b) => {
                self.compile_recursive(a, ops)?;
                self.compile_recursive(b, ops)?;
                ops.push(match func {
                    Func::Min => OpCode::Min,
                    Func::Max => OpCode::Max,
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<OpCode, CoreError> {
        if name == "t" {
            return Ok(OpCode::LoadTime);
        }
        if let Some(&idx) = self.var_map.get(name) {
            return Ok(OpCode::LoadVar(idx));
        }
        if let Some(&idx) = self.param_map.get(name) {
            return Ok(OpCode::LoadParam(idx));
        }
        if let Some(&idx) = self.inter_map.get(name) {
            return Ok(OpCode::LoadInter(idx));
        }
        if self.all_inters.iter().any(|n| n == name) {
            return Err(CoreError::ForwardReference(name.to_string()));
        }
        Err(CoreError::UndefinedIdentifier(name.to_string()))
    }
}

/// A fully compiled model: one bytecode per intermediate (declaration order)
/// and one per derivative (stock order), with parameter values resolved.
///
/// Interior mutability for the VM scratch buffers avoids allocation in
/// `apply`. This makes the compiled model !Sync; each run compiles its own.
#[derive(Debug)]
pub struct CompiledModel {
    stock_names: Vec<String>,
    initials: Vec<f64>,
    inter_codes: Vec<Bytecode>,
    deriv_codes: Vec<Bytecode>,
    params: Vec<f64>,
    stack: RefCell<Vec<f64>>,
    inters: RefCell<Vec<f64>>,
}

impl CompiledModel {
    pub fn stock_names(&self) -> &[String] {
        &self.stock_names
    }

    /// Initial stock values in declaration order.
    pub fn initials(&self) -> &[f64] {
        &self.initials
    }
}

/// Compiles the model with parameter defaults overridden by `overrides`.
/// Unknown override names are ignored; declared parameters missing from the
/// overrides take their defaults.
pub fn compile(
    model: &ModelState,
    overrides: &HashMap<String, f64>,
) -> Result<CompiledModel, CoreError> {
    let stock_names = model.stock_names();
    let param_names: Vec<&str> = model.parameters.iter().map(|p| p.name.as_str()).collect();
    let inter_names: Vec<&str> = model.intermediates.iter().map(|i| i.name.as_str()).collect();

    let mut compiler = Compiler::new(&stock_names, &param_names, &inter_names);

    let mut inter_codes = Vec::with_capacity(model.intermediates.len());
    for inter in &model.intermediates {
        let code = compiler.compile_str(&inter.formula)?;
        inter_codes.push(code);
        compiler.define_intermediate(&inter.name);
    }

    let mut deriv_codes = Vec::with_capacity(model.stocks.len());
    for stock in &model.stocks {
        let deriv = model
            .derivative_of(&stock.name)
            .ok_or_else(|| CoreError::MissingDerivative(stock.name.clone()))?;
        deriv_codes.push(compiler.compile_str(&deriv.formula)?);
    }

    let params = model
        .parameters
        .iter()
        .map(|p| overrides.get(&p.name).copied().unwrap_or(p.default))
        .collect();

    let inter_count = inter_codes.len();
    Ok(CompiledModel {
        stock_names: stock_names.iter().map(|s| s.to_string()).collect(),
        initials: model.stocks.iter().map(|s| s.initial).collect(),
        inter_codes,
        deriv_codes,
        params,
        stack: RefCell::new(Vec::with_capacity(64)),
        inters: RefCell::new(vec![0.0; inter_count]),
    })
}

impl DynamicalSystem<f64> for CompiledModel {
    fn dimension(&self) -> usize {
        self.deriv_codes.len()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let mut stack = self.stack.borrow_mut();
        let mut inters = self.inters.borrow_mut();

        for i in 0..self.inter_codes.len() {
            let value = Vm::execute(
                &self.inter_codes[i],
                t,
                x,
                &self.params,
                &inters[..i],
                &mut stack,
            );
            inters[i] = value;
        }
        for (i, code) in self.deriv_codes.iter().enumerate() {
            out[i] = Vm::execute(code, t, x, &self.params, &inters, &mut stack);
        }
    }
}
