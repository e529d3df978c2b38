//! The convergence engine: runs processing cycles for targets.
//!
//! A cycle walks `Idle → Resolving → Applying → Finalizing → Idle`:
//! ```text
//! Fetch facts → Resolve bundles → Apply per handler → Unlink cleanup
//! ```

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::diagnostics::{CycleEmitter, DiagnosticsSink, TracingSink};
use crate::retry::RetryPolicy;
use crate::scheduler::{unattempted, ItemExecutor};
use converge_core::{
    Category, CyclePhase, DiagnosticKind, HandlerRun, InvalidTransition, ItemOutcome, ItemReport,
    Level, PolicyBundle, ProcessingCycle, TargetContext, TargetId,
};
use converge_handlers::{HandlerRegistry, Registration};
use converge_resolver::{resolve, Resolution, ResolvedItem, ResolverError};
use converge_storage::{KeyedLocks, StateStore};
use converge_targeting::{FactError, FactProvider};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serializes cycles per target.
pub type TargetLocks = KeyedLocks<TargetId>;

/// Handler-run name for items whose category has no handler.
pub const UNREGISTERED: &str = "unregistered";

/// Errors that abort a cycle before anything is applied.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// Facts could not be fetched
    #[error("fact provider failed: {0}")]
    Facts(#[from] FactError),

    /// Bundles could not be resolved
    #[error("resolution failed: {0}")]
    Resolver(#[from] ResolverError),

    /// Phase machine misuse
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// A cycle task died
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Report what would change without calling handlers or writing records
    pub dry_run: bool,
    /// Checked between items
    pub cancel: CancelToken,
}

impl RunOptions {
    /// Dry-run options.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    /// Observe `cancel`.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Drives processing cycles. Cheap to clone; clones share locks and sinks.
#[derive(Clone)]
pub struct ConvergenceEngine {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn StateStore>,
    facts: Arc<dyn FactProvider>,
    sink: Arc<dyn DiagnosticsSink>,
    config: Arc<EngineConfig>,
    locks: Arc<TargetLocks>,
}

impl ConvergenceEngine {
    /// Create an engine with default configuration, logging diagnostics
    /// through `tracing`.
    pub fn new(
        registry: HandlerRegistry,
        store: Arc<dyn StateStore>,
        facts: Arc<dyn FactProvider>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            facts,
            sink: Arc::new(TracingSink),
            config: Arc::new(EngineConfig::default()),
            locks: Arc::new(TargetLocks::new()),
        }
    }

    /// Set the diagnostics sink.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered handlers.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// State store holding applied item records.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run one processing cycle for `target`.
    ///
    /// Item failures are reported in the returned cycle; only fact and
    /// resolution failures are errors.
    pub async fn run_cycle(
        &self,
        target: &TargetId,
        bundles: &[PolicyBundle],
        options: &RunOptions,
    ) -> Result<ProcessingCycle, CycleError> {
        let _guard = self.locks.lock(target).await;

        let mut cycle = ProcessingCycle::new(target.clone(), options.dry_run);
        let emitter = CycleEmitter::new(self.sink.clone(), cycle.id, target.clone());
        info!(cycle_id = %cycle.id, target = %target, dry_run = options.dry_run, "cycle started");
        emitter.cycle(
            Level::Info,
            DiagnosticKind::CycleStarted,
            format!("cycle started for {} ({} bundle(s))", target, bundles.len()),
        );

        // 1. Resolve
        transition(&mut cycle, &emitter, CyclePhase::Resolving)?;
        let resolution = match self.resolve(target, bundles).await {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(cycle_id = %cycle.id, target = %target, error = %e, "cycle aborted");
                emitter.cycle(Level::Error, DiagnosticKind::CycleAborted, e.to_string());
                transition(&mut cycle, &emitter, CyclePhase::Idle)?;
                return Err(e);
            }
        };
        for conflict in &resolution.conflicts {
            warn!(cycle_id = %cycle.id, %conflict, "resolution conflict");
            emitter.cycle(Level::Warn, DiagnosticKind::Conflict, conflict.to_string());
        }
        for warning in &resolution.warnings {
            warn!(cycle_id = %cycle.id, %warning, "targeting warning");
            emitter.cycle(Level::Warn, DiagnosticKind::TargetingWarning, warning.to_string());
            cycle.warnings.push(warning.to_string());
        }
        cycle.conflicts = resolution.conflicts.clone();

        // 2. Apply
        transition(&mut cycle, &emitter, CyclePhase::Applying)?;
        let (mut batches, unregistered) = self.partition(&resolution);
        for registration in self.registry.iter() {
            let Some(items) = batches.remove(&registration.category()) else {
                continue;
            };
            debug!(
                cycle_id = %cycle.id,
                handler = registration.name(),
                items = items.len(),
                mode = %registration.mode(),
                "running handler"
            );
            let executor = self.executor(registration.clone(), &emitter, target, options.dry_run);
            let reports = executor
                .run_batch(items, &options.cancel, self.config.max_parallel_items)
                .await;
            cycle.handlers.push(HandlerRun {
                handler: registration.name().to_string(),
                category: registration.category(),
                items: reports,
            });
        }
        for (category, items) in unregistered {
            warn!(cycle_id = %cycle.id, %category, items = items.len(), "no handler registered");
            let reports = items
                .iter()
                .map(|resolved| {
                    let report = unattempted(resolved, ItemOutcome::FailedPermanent)
                        .with_error(format!("no handler registered for category {}", category));
                    emitter.outcome(&report);
                    report
                })
                .collect();
            cycle.handlers.push(HandlerRun {
                handler: UNREGISTERED.to_string(),
                category,
                items: reports,
            });
        }
        cycle.cancelled = options.cancel.is_cancelled();

        // 3. Finalize
        transition(&mut cycle, &emitter, CyclePhase::Finalizing)?;
        if cycle.cancelled {
            info!(cycle_id = %cycle.id, "cancelled, skipping unlink cleanup");
        } else {
            cycle.unlinked = self
                .clean_up_unlinked(target, &resolution, &emitter, options)
                .await;
            cycle.cancelled = options.cancel.is_cancelled();
        }

        transition(&mut cycle, &emitter, CyclePhase::Idle)?;
        let summary = cycle.summary();
        info!(
            cycle_id = %cycle.id,
            target = %target,
            success = cycle.success(),
            %summary,
            "cycle finished"
        );
        emitter.cycle(Level::Info, DiagnosticKind::CycleFinished, summary.to_string());
        Ok(cycle)
    }

    /// Run cycles for several targets concurrently. Results come back in
    /// the order of `targets`.
    pub async fn run_many(
        &self,
        targets: &[TargetId],
        bundles: &[PolicyBundle],
        options: &RunOptions,
    ) -> Vec<(TargetId, Result<ProcessingCycle, CycleError>)> {
        let bundles: Arc<[PolicyBundle]> = bundles.into();
        let mut tasks = JoinSet::new();
        for (index, target) in targets.iter().cloned().enumerate() {
            let engine = self.clone();
            let bundles = bundles.clone();
            let options = options.clone();
            tasks.spawn(async move {
                let result = engine.run_cycle(&target, &bundles, &options).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<ProcessingCycle, CycleError>>> =
            targets.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "cycle task failed"),
            }
        }

        targets
            .iter()
            .cloned()
            .zip(results)
            .map(|(target, result)| {
                let result = result
                    .unwrap_or_else(|| Err(CycleError::Internal(format!("cycle task for {} failed", target))));
                (target, result)
            })
            .collect()
    }

    async fn resolve(&self, target: &TargetId, bundles: &[PolicyBundle]) -> Result<Resolution, CycleError> {
        let facts = self.facts.get_facts(target).await?;
        let ctx = TargetContext::new(target.clone(), facts);
        Ok(resolve(bundles, &ctx)?)
    }

    /// Group items by category in resolution order; items without a
    /// handler are split off in first-seen category order.
    #[allow(clippy::type_complexity)]
    fn partition(
        &self,
        resolution: &Resolution,
    ) -> (HashMap<Category, Vec<ResolvedItem>>, Vec<(Category, Vec<ResolvedItem>)>) {
        let mut batches: HashMap<Category, Vec<ResolvedItem>> = HashMap::new();
        let mut unregistered: Vec<(Category, Vec<ResolvedItem>)> = Vec::new();
        for resolved in &resolution.items {
            let category = resolved.category();
            if self.registry.get(category).is_some() {
                batches.entry(category).or_default().push(resolved.clone());
            } else if let Some((_, items)) = unregistered.iter_mut().find(|(c, _)| *c == category) {
                items.push(resolved.clone());
            } else {
                unregistered.push((category, vec![resolved.clone()]));
            }
        }
        (batches, unregistered)
    }

    fn executor(
        &self,
        registration: Registration,
        emitter: &CycleEmitter,
        target: &TargetId,
        dry_run: bool,
    ) -> ItemExecutor {
        ItemExecutor {
            registration,
            store: self.store.clone(),
            emitter: emitter.clone(),
            retry: RetryPolicy::from(&self.config.retry),
            timeout: self.config.item_timeout(),
            target: target.clone(),
            dry_run,
        }
    }

    /// Undo records whose items no longer resolve and asked to be removed.
    async fn clean_up_unlinked(
        &self,
        target: &TargetId,
        resolution: &Resolution,
        emitter: &CycleEmitter,
        options: &RunOptions,
    ) -> Vec<ItemReport> {
        let records = match self.store.list_records(target).await {
            Ok(records) => records,
            Err(e) => {
                warn!(target = %target, error = %e, "could not list applied records, skipping unlink cleanup");
                emitter.cycle(
                    Level::Warn,
                    DiagnosticKind::RecordReadFailed,
                    format!("could not list applied records: {}", e),
                );
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        for record in records {
            if resolution.contains(record.category, &record.resource_key) {
                continue;
            }
            if !record.remove_on_unlink {
                debug!(record = %record.key(), "unlinked record kept");
                continue;
            }
            if options.cancel.is_cancelled() {
                break;
            }
            let Some(registration) = self.registry.get(record.category) else {
                warn!(record = %record.key(), "no handler for unlinked record, keeping it");
                continue;
            };
            let executor = self.executor(registration.clone(), emitter, target, options.dry_run);
            reports.push(executor.remove(&record).await);
        }
        reports
    }
}

fn transition(
    cycle: &mut ProcessingCycle,
    emitter: &CycleEmitter,
    to: CyclePhase,
) -> Result<(), CycleError> {
    let from = cycle.phase();
    cycle.enter(to)?;
    debug!(cycle_id = %cycle.id, %from, %to, "phase transition");
    emitter.cycle(
        Level::Debug,
        DiagnosticKind::PhaseTransition,
        format!("{} -> {}", from, to),
    );
    Ok(())
}
