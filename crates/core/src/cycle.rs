//! Processing cycles - the engine's per-target run log.

use crate::bundle::{Action, Category};
use crate::id::{BundleId, CycleId, TargetId};
use crate::Time;
use serde::{Deserialize, Serialize};

/// Phase of a processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// No cycle running
    Idle,
    /// Fetching facts and resolving bundles
    Resolving,
    /// Invoking handlers
    Applying,
    /// Unlink cleanup and summary
    Finalizing,
}

impl CyclePhase {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Resolving -> Idle` is the abort path for fatal resolution errors.
    pub fn can_transition_to(&self, next: CyclePhase) -> bool {
        matches!(
            (self, next),
            (CyclePhase::Idle, CyclePhase::Resolving)
                | (CyclePhase::Resolving, CyclePhase::Applying)
                | (CyclePhase::Resolving, CyclePhase::Idle)
                | (CyclePhase::Applying, CyclePhase::Finalizing)
                | (CyclePhase::Finalizing, CyclePhase::Idle)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Resolving => "resolving",
            CyclePhase::Applying => "applying",
            CyclePhase::Finalizing => "finalizing",
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal phase change requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal cycle transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current phase
    pub from: CyclePhase,
    /// Requested phase
    pub to: CyclePhase,
}

/// A recorded phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Phase left
    pub from: CyclePhase,
    /// Phase entered
    pub to: CyclePhase,
    /// When
    pub at: Time,
}

/// Final outcome of one item in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemOutcome {
    /// Handler succeeded
    Applied,
    /// Apply-once item already applied with the same fingerprint
    SkippedApplyOnce,
    /// Transient failures until retries ran out
    FailedTransientExhausted,
    /// Permanent failure, not retried
    FailedPermanent,
    /// Unlinked item undone and its record purged
    Removed,
    /// Not attempted because the cycle was cancelled
    Cancelled,
    /// Dry run: would have been applied
    WouldApply,
    /// Dry run: would have been removed
    WouldRemove,
}

impl ItemOutcome {
    /// Outcome name as printed by the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Applied => "applied",
            ItemOutcome::SkippedApplyOnce => "skipped-apply-once",
            ItemOutcome::FailedTransientExhausted => "failed-transient-exhausted",
            ItemOutcome::FailedPermanent => "failed-permanent",
            ItemOutcome::Removed => "removed",
            ItemOutcome::Cancelled => "cancelled",
            ItemOutcome::WouldApply => "would-apply",
            ItemOutcome::WouldRemove => "would-remove",
        }
    }

    /// Whether this outcome counts as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::FailedTransientExhausted | ItemOutcome::FailedPermanent
        )
    }
}

impl std::fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Resource did not exist and was written
    Created,
    /// Resource was overwritten
    Replaced,
    /// Fields were merged into the resource
    Updated,
    /// Resource was removed
    Deleted,
    /// Nothing needed to change
    Unchanged,
}

impl Change {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Created => "created",
            Change::Replaced => "replaced",
            Change::Updated => "updated",
            Change::Deleted => "deleted",
            Change::Unchanged => "unchanged",
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item result within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    /// Resource category
    pub category: Category,

    /// Resource key
    pub resource_key: String,

    /// Action attempted
    pub action: Action,

    /// Bundle the item came from
    pub bundle_id: BundleId,

    /// Final outcome
    pub outcome: ItemOutcome,

    /// Change reported by the handler on success
    pub change: Option<Change>,

    /// Handler invocations made (0 if never called)
    pub attempts: u32,

    /// Last error, if any
    pub error: Option<String>,
}

impl ItemReport {
    /// Report with no handler call yet.
    pub fn new(
        category: Category,
        resource_key: impl Into<String>,
        action: Action,
        bundle_id: BundleId,
        outcome: ItemOutcome,
    ) -> Self {
        Self {
            category,
            resource_key: resource_key.into(),
            action,
            bundle_id,
            outcome,
            change: None,
            attempts: 0,
            error: None,
        }
    }

    /// Attach an error detail.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Items processed by one handler during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRun {
    /// Handler name
    pub handler: String,

    /// Category served
    pub category: Category,

    /// Item reports, in processing order
    pub items: Vec<ItemReport>,
}

/// Several bundles targeted the same resource; one won.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Resource category
    pub category: Category,

    /// Resource key
    pub resource_key: String,

    /// Winning bundle
    pub winner: BundleId,

    /// Every other bundle that declared the resource
    pub shadowed: Vec<BundleId>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shadowed: Vec<&str> = self.shadowed.iter().map(BundleId::as_str).collect();
        write!(
            f,
            "{}:{} won by {} over {}",
            self.category,
            self.resource_key,
            self.winner,
            shadowed.join(", ")
        )
    }
}

/// One convergence run for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingCycle {
    /// Unique identifier
    pub id: CycleId,

    /// Target converged
    pub target: TargetId,

    /// When the cycle started
    pub started_at: Time,

    /// When the cycle returned to idle
    pub finished_at: Option<Time>,

    /// Every phase change, in order
    pub transitions: Vec<PhaseTransition>,

    /// Handler runs, in registration order
    pub handlers: Vec<HandlerRun>,

    /// Unlink cleanup results
    pub unlinked: Vec<ItemReport>,

    /// Conflicts found during resolution
    pub conflicts: Vec<Conflict>,

    /// Targeting warnings found during resolution
    #[serde(default)]
    pub warnings: Vec<String>,

    /// Whether handlers were skipped
    pub dry_run: bool,

    /// Whether cancellation was requested during the cycle
    pub cancelled: bool,
}

impl ProcessingCycle {
    /// Start a new idle cycle.
    pub fn new(target: TargetId, dry_run: bool) -> Self {
        Self {
            id: CycleId::new(),
            target,
            started_at: chrono::Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
            handlers: Vec::new(),
            unlinked: Vec::new(),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            dry_run,
            cancelled: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> CyclePhase {
        self.transitions
            .last()
            .map(|t| t.to)
            .unwrap_or(CyclePhase::Idle)
    }

    /// Move to `to`, recording the transition.
    pub fn enter(&mut self, to: CyclePhase) -> Result<(), InvalidTransition> {
        let from = self.phase();
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        let at = chrono::Utc::now();
        self.transitions.push(PhaseTransition { from, to, at });
        if to == CyclePhase::Idle {
            self.finished_at = Some(at);
        }
        Ok(())
    }

    /// All item reports: handler runs first, then unlink cleanup.
    pub fn items(&self) -> impl Iterator<Item = &ItemReport> {
        self.handlers
            .iter()
            .flat_map(|run| run.items.iter())
            .chain(self.unlinked.iter())
    }

    /// True if no item failed.
    pub fn success(&self) -> bool {
        !self.items().any(|item| item.outcome.is_failure())
    }

    /// Outcome counts.
    pub fn summary(&self) -> CycleSummary {
        let mut summary = CycleSummary {
            conflicts: self.conflicts.len(),
            ..CycleSummary::default()
        };
        for item in self.items() {
            summary.count(item.outcome);
        }
        summary
    }

    /// Wall-clock duration, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// Item counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// `applied`
    pub applied: usize,
    /// `skipped-apply-once`
    pub skipped_apply_once: usize,
    /// `failed-transient-exhausted`
    pub failed_transient_exhausted: usize,
    /// `failed-permanent`
    pub failed_permanent: usize,
    /// `removed`
    pub removed: usize,
    /// `cancelled`
    pub cancelled: usize,
    /// `would-apply`
    pub would_apply: usize,
    /// `would-remove`
    pub would_remove: usize,
    /// Resolution conflicts
    pub conflicts: usize,
}

impl CycleSummary {
    fn count(&mut self, outcome: ItemOutcome) {
        let slot = match outcome {
            ItemOutcome::Applied => &mut self.applied,
            ItemOutcome::SkippedApplyOnce => &mut self.skipped_apply_once,
            ItemOutcome::FailedTransientExhausted => &mut self.failed_transient_exhausted,
            ItemOutcome::FailedPermanent => &mut self.failed_permanent,
            ItemOutcome::Removed => &mut self.removed,
            ItemOutcome::Cancelled => &mut self.cancelled,
            ItemOutcome::WouldApply => &mut self.would_apply,
            ItemOutcome::WouldRemove => &mut self.would_remove,
        };
        *slot += 1;
    }

    /// Total items reported.
    pub fn total(&self) -> usize {
        self.applied
            + self.skipped_apply_once
            + self.failed_transient_exhausted
            + self.failed_permanent
            + self.removed
            + self.cancelled
            + self.would_apply
            + self.would_remove
    }

    /// Failed items of either kind.
    pub fn failed(&self) -> usize {
        self.failed_transient_exhausted + self.failed_permanent
    }
}

impl std::fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = [
            (ItemOutcome::Applied, self.applied),
            (ItemOutcome::SkippedApplyOnce, self.skipped_apply_once),
            (ItemOutcome::FailedTransientExhausted, self.failed_transient_exhausted),
            (ItemOutcome::FailedPermanent, self.failed_permanent),
            (ItemOutcome::Removed, self.removed),
            (ItemOutcome::Cancelled, self.cancelled),
            (ItemOutcome::WouldApply, self.would_apply),
            (ItemOutcome::WouldRemove, self.would_remove),
        ];
        let parts: Vec<String> = counts
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(outcome, n)| format!("{} {}", n, outcome))
            .collect();
        if parts.is_empty() {
            write!(f, "no items")?;
        } else {
            write!(f, "{}", parts.join(", "))?;
        }
        if self.conflicts > 0 {
            write!(f, "; {} conflict(s)", self.conflicts)?;
        }
        Ok(())
    }
}
