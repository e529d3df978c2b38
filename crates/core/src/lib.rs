//! Converge core data models.
//!
//! This crate defines the data structures shared by every layer of the
//! convergence engine: identifiers, target facts, targeting expressions,
//! policy bundles, applied-item records, processing cycles and diagnostics.

#![warn(missing_docs)]

// Identities
mod id;

// Desired state
mod bundle;
mod expr;
mod fact;

// Engine bookkeeping
mod cycle;
mod diagnostic;
mod record;

// Re-exports
pub use id::{BundleId, CycleId, IdError, TargetId};

pub use bundle::{
    Action, ApplyPolicy, BundleError, Category, Fingerprint, PolicyBundle, PreferenceItem,
};
pub use expr::{CompareOp, Expr, Literal, Predicate, PredicateError, MAX_DEPTH};
pub use fact::{FactValue, Facts, TargetContext, Version};

pub use cycle::{
    Change, Conflict, CyclePhase, CycleSummary, HandlerRun, InvalidTransition, ItemOutcome,
    ItemReport, PhaseTransition, ProcessingCycle,
};
pub use diagnostic::{DiagnosticKind, DiagnosticRecord, Level};
pub use record::{AppliedItemRecord, RecordKey};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
