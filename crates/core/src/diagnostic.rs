//! Diagnostic records - the append-only event stream of a cycle.

use crate::bundle::{Action, Category};
use crate::cycle::ItemOutcome;
use crate::id::{CycleId, TargetId};
use crate::Time;
use serde::{Deserialize, Serialize};

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Phase transitions and per-item steps
    Debug,
    /// Cycle boundaries and applied items
    Info,
    /// Conflicts, targeting problems, record-write failures
    Warn,
    /// Failed items and fatal aborts
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a diagnostic record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Cycle began
    CycleStarted,
    /// Cycle phase changed
    PhaseTransition,
    /// Resolution picked a winner among several bundles
    Conflict,
    /// Targeting could not be evaluated for an item
    TargetingWarning,
    /// An item reached its outcome
    ItemOutcome,
    /// Persisting an applied-item record failed
    RecordWriteFailed,
    /// Reading applied-item records failed
    RecordReadFailed,
    /// Cycle aborted before applying
    CycleAborted,
    /// Cycle returned to idle
    CycleFinished,
}

/// One diagnostic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Cycle that produced the record
    pub cycle_id: CycleId,

    /// When it happened
    pub timestamp: Time,

    /// Severity
    pub level: Level,

    /// Event kind
    pub kind: DiagnosticKind,

    /// Target of the cycle
    pub target_id: TargetId,

    /// Item category, for item-level records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,

    /// Item resource key, for item-level records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<String>,

    /// Item action, for item-level records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    /// Item outcome, for outcome records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ItemOutcome>,

    /// Error detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    /// Human-readable message
    pub message: String,
}

impl DiagnosticRecord {
    /// Create a cycle-level record.
    pub fn new(
        cycle_id: CycleId,
        target_id: TargetId,
        level: Level,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cycle_id,
            timestamp: chrono::Utc::now(),
            level,
            kind,
            target_id,
            category: None,
            resource_key: None,
            action: None,
            outcome: None,
            error_detail: None,
            message: message.into(),
        }
    }

    /// Attach the item the record is about.
    pub fn with_item(mut self, category: Category, resource_key: impl Into<String>, action: Action) -> Self {
        self.category = Some(category);
        self.resource_key = Some(resource_key.into());
        self.action = Some(action);
        self
    }

    /// Attach an item outcome.
    pub fn with_outcome(mut self, outcome: ItemOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Attach an error detail.
    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}
