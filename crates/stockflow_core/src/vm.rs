//! Stack-based virtual machine for evaluating compiled formulas.
//!
//! The VM is stateless; `execute` takes all necessary context:
//! - `bytecode`: instructions to run
//! - `t`: current simulation time
//! - `vars`: current stock values (read-only)
//! - `params`: parameter values (read-only)
//! - `inters`: intermediates already computed this evaluation (read-only)
//! - `stack`: a mutable buffer reused across evaluations
//!
//! Determinism is load-bearing here: the stability validator compares probe
//! runs of candidate models, which is only meaningful because evaluation has
//! no hidden state.

use crate::traits::Scalar;

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a stock (by declaration index) onto the stack.
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pushes an already-computed intermediate (by declaration index).
    LoadInter(usize),
    /// Pushes the current simulation time.
    LoadTime,
    /// Pops (b, a), pushes a + b.
    Add,
    /// Pops (b, a), pushes a - b.
    Sub,
    /// Pops (b, a), pushes a * b.
    Mul,
    /// Pops (b, a), pushes a / b.
    Div,
    /// Pops a, pushes -a.
    Neg,
    /// Pops (b, a), pushes min(a, b).
    Min,
    /// Pops (b, a), pushes max(a, b).
    Max,
    /// Comparison opcodes pop (b, a) and push 1.0 or 0.0.
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// Pops (else, then, cond), pushes `then` if cond is nonzero, else `else`.
    Select,
}

/// A compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based virtual machine. Stateless; see module docs.
pub struct Vm;

impl Vm {
    /// Executes the bytecode and returns the value left on the stack.
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        t: T,
        vars: &[T],
        params: &[T],
        inters: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap());
                }
                OpCode::LoadVar(idx) => {
                    stack.push(vars[*idx]);
                }
                OpCode::LoadParam(idx) => {
                    stack.push(params[*idx]);
                }
                OpCode::LoadInter(idx) => {
                    stack.push(inters[*idx]);
                }
                OpCode::LoadTime => {
                    stack.push(t);
                }
                OpCode::Add => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a / b);
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap();
                    stack.push(-a);
                }
                OpCode::Min => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a.min(b));
                }
                OpCode::Max => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a.max(b));
                }
                OpCode::Lt => Self::compare(stack, |a, b| a < b),
                OpCode::Le => Self::compare(stack, |a, b| a <= b),
                OpCode::Gt => Self::compare(stack, |a, b| a > b),
                OpCode::Ge => Self::compare(stack, |a, b| a >= b),
                OpCode::Eq => Self::compare(stack, |a, b| a == b),
                OpCode::Ne => Self::compare(stack, |a, b| a != b),
                OpCode::Select => {
                    let els = stack.pop().unwrap();
                    let then = stack.pop().unwrap();
                    let cond = stack.pop().unwrap();
                    stack.push(if cond != T::zero() { then } else { els });
                }
            }
        }

        // The compiler always emits code leaving exactly one value.
        stack.pop().unwrap_or_else(|| T::zero())
    }

    fn compare<T: Scalar>(stack: &mut Vec<T>, pred: impl Fn(T, T) -> bool) {
        let b = stack.pop().unwrap();
        let a = stack.pop().unwrap();
        stack.push(if pred(a, b) { T::one() } else { T::zero() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(ops: Vec<OpCode>) -> f64 {
        let code = Bytecode { ops };
        let mut stack = Vec::new();
        Vm::execute(&code, 0.0, &[], &[], &[], &mut stack)
    }

    #[test]
    fn evaluates_arithmetic() {
        let result = run(vec![
            OpCode::LoadConst(2.0),
            OpCode::LoadConst(3.0),
            OpCode::Mul,
            OpCode::LoadConst(1.0),
            OpCode::Add,
        ]);
        assert_eq!(result, 7.0);
    }

    #[test]
    fn comparison_pushes_indicator_values() {
        let result = run(vec![
            OpCode::LoadConst(1.0),
            OpCode::LoadConst(2.0),
            OpCode::Le,
        ]);
        assert_eq!(result, 1.0);

        let result = run(vec![
            OpCode::LoadConst(3.0),
            OpCode::LoadConst(2.0),
            OpCode::Le,
        ]);
        assert_eq!(result, 0.0);
    }

    #[test]
    fn select_chooses_branch_by_condition() {
        let result = run(vec![
            OpCode::LoadConst(0.0),
            OpCode::LoadConst(10.0),
            OpCode::LoadConst(20.0),
            OpCode::Select,
        ]);
        assert_eq!(result, 20.0);
    }

    #[test]
    fn reads_time_vars_params_and_inters() {
        let code = Bytecode {
            ops: vec![
                OpCode::LoadTime,
                OpCode::LoadVar(0),
                OpCode::Add,
                OpCode::LoadParam(0),
                OpCode::Add,
                OpCode::LoadInter(0),
                OpCode::Add,
            ],
        };
        let mut stack = Vec::new();
        let result = Vm::execute(&code, 1.0, &[2.0], &[4.0], &[8.0], &mut stack);
        assert_eq!(result, 15.0);
    }

    #[test]
    fn min_max_match_float_semantics() {
        let result = run(vec![
            OpCode::LoadConst(-1.0),
            OpCode::LoadConst(0.5),
            OpCode::Max,
        ]);
        assert_eq!(result, 0.5);
        let result = run(vec![
            OpCode::LoadConst(-1.0),
            OpCode::LoadConst(0.5),
            OpCode::Min,
        ]);
        assert_eq!(result, -1.0);
    }
}
