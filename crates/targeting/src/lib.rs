//! Targeting for Converge.
//!
//! Fact providers supply a target's facts; the evaluator decides whether a
//! targeting expression matches an immutable [`TargetContext`] snapshot.
//!
//! [`TargetContext`]: converge_core::TargetContext

#![warn(missing_docs)]

pub mod evaluator;
pub mod facts;

pub use evaluator::{evaluate, evaluate_tristate, EvalError};
pub use facts::{FactError, FactProvider, JsonFactProvider, StaticFactProvider};
