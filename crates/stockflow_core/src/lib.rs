//! The `stockflow_core` crate is the pure math layer of the stockflow
//! engine: no I/O, no clocks, no shared state.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `DynamicalSystem`
//!   (continuous-time systems), `Steppable` (fixed-step solvers).
//! - **Formula**: a restricted expression grammar parsed into an AST;
//!   untrusted formulas are data, never executable code.
//! - **Compile**: lowers a `ModelState` to bytecode evaluated by a small
//!   stack VM, with identifiers resolved at compile time.
//! - **Solvers**: fixed-step RK4 and the adaptive Dormand–Prince 5(4)
//!   driver used for all production runs.
//! - **Probe**: the stress simulation that classifies candidate models as
//!   stable or unstable before they are committed.
pub mod compile;
pub mod error;
pub mod formula;
pub mod model;
pub mod probe;
pub mod solvers;
pub mod traits;
pub mod vm;
