//! Veil Policy Evaluation Adapter
//!
//! Turns (acting identity, requested operation, sidecar policy document)
//! into a decision. Policy documents sit next to the entries they govern
//! under a fixed name prefix and are evaluated by an external engine.
//!
//! Failure is never an error to the filesystem caller: anything that
//! prevents a clean answer, including a slow engine, is undecided and
//! hides the entry.

pub mod adapter;
pub mod engine;
pub mod error;
pub mod types;

pub use adapter::PolicyAdapter;
pub use engine::{extract_result, CommandEngine, EngineConfig, PolicyEngine};
pub use error::{PolicyError, PolicyResult};
pub use types::{Decision, MissingPolicy, Operation, PolicyConfig};
