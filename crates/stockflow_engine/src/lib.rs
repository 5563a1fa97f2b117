//! Stateful boundary around the stockflow core.
//!
//! The core crate compiles and integrates models; this crate owns the live
//! one. It holds the committed [`model::ModelState`](stockflow_core::model::ModelState)
//! behind the [`Engine`] façade, normalizes incoming edit operations,
//! validates them semantically and with the stability probe, and records
//! every accepted version in an append-only ledger.

pub mod engine;
pub mod error;
pub mod ledger;
pub mod normalize;
pub mod ops;
pub mod semantic;
pub mod store;

pub use engine::{ApplyOutcome, Engine, OperationSource};
pub use error::EngineError;
pub use ledger::{Ledger, VersionRecord};
pub use normalize::{NormalizedOperation, Repair, RepairRule};
pub use ops::{operation_catalog, Operation};
pub use store::{ModelStore, RunRequest, RunResult};
