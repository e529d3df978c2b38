//! Per-item scheduling: apply-once checks, retries, timeouts and bounded
//! parallelism for one handler's batch.

use crate::cancel::CancelToken;
use crate::diagnostics::CycleEmitter;
use crate::retry::RetryPolicy;
use converge_core::{
    Action, AppliedItemRecord, ApplyPolicy, DiagnosticKind, ItemOutcome, ItemReport, Level,
    PreferenceItem, RecordKey, TargetId,
};
use converge_handlers::{ApplyResult, ExecutionMode, HandlerError, Registration, ResourceState};
use converge_resolver::ResolvedItem;
use converge_storage::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs items through one registered handler.
#[derive(Clone)]
pub(crate) struct ItemExecutor {
    pub(crate) registration: Registration,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) emitter: CycleEmitter,
    pub(crate) retry: RetryPolicy,
    pub(crate) timeout: Duration,
    pub(crate) target: TargetId,
    pub(crate) dry_run: bool,
}

/// Report for an item that was never attempted.
pub(crate) fn unattempted(resolved: &ResolvedItem, outcome: ItemOutcome) -> ItemReport {
    ItemReport::new(
        resolved.item.category,
        resolved.item.resource_key.clone(),
        resolved.item.action,
        resolved.bundle_id.clone(),
        outcome,
    )
}

impl ItemExecutor {
    /// Converge one resolved item and record the outcome.
    pub(crate) async fn execute(&self, resolved: ResolvedItem) -> ItemReport {
        let item = &resolved.item;
        let key = RecordKey::new(self.target.clone(), item.category, item.resource_key.clone());

        if item.apply_policy == ApplyPolicy::ApplyOnceThenIgnore {
            match self.store.get_record(&key).await {
                Ok(Some(record)) if record.fingerprint == resolved.fingerprint => {
                    debug!(record = %key, "already applied once, skipping");
                    let report = unattempted(&resolved, ItemOutcome::SkippedApplyOnce);
                    self.emitter.outcome(&report);
                    return report;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(record = %key, error = %e, "could not read applied record, applying");
                    self.emitter.item(
                        Level::Warn,
                        DiagnosticKind::RecordReadFailed,
                        (item.category, &item.resource_key, item.action),
                        "could not read applied record",
                        Some(&e.to_string()),
                    );
                }
            }
        }

        if self.dry_run {
            let report = unattempted(&resolved, ItemOutcome::WouldApply);
            self.emitter.outcome(&report);
            return report;
        }

        let (result, attempts) = self.apply_with_retry(item).await;
        let mut report = unattempted(&resolved, ItemOutcome::Applied);
        report.attempts = attempts;
        match result {
            Ok(applied) => {
                report.change = Some(applied.change);
                self.persist(&key, &resolved).await;
            }
            Err(e) => {
                report.outcome = failure_outcome(&e);
                report.error = Some(e.to_string());
            }
        }
        self.emitter.outcome(&report);
        report
    }

    /// Undo an unlinked record with a synthesized delete.
    pub(crate) async fn remove(&self, record: &AppliedItemRecord) -> ItemReport {
        let mut report = ItemReport::new(
            record.category,
            record.resource_key.clone(),
            Action::Delete,
            record.source_bundle_id.clone(),
            ItemOutcome::WouldRemove,
        );
        if self.dry_run {
            self.emitter.outcome(&report);
            return report;
        }

        let item = PreferenceItem::delete_of(record.category, record.resource_key.clone());
        let (result, attempts) = self.apply_with_retry(&item).await;
        report.attempts = attempts;
        match result {
            Ok(applied) => {
                report.outcome = ItemOutcome::Removed;
                report.change = Some(applied.change);
                let key = record.key();
                if let Err(e) = self.store.delete_record(&key).await {
                    self.record_failure(&item, &e.to_string());
                }
            }
            Err(e) => {
                // The record stays so the next cycle tries again.
                report.outcome = failure_outcome(&e);
                report.error = Some(e.to_string());
            }
        }
        self.emitter.outcome(&report);
        report
    }

    async fn persist(&self, key: &RecordKey, resolved: &ResolvedItem) {
        let result = if resolved.item.action == Action::Delete {
            self.store.delete_record(key).await
        } else {
            let record = AppliedItemRecord::for_item(
                self.target.clone(),
                resolved.bundle_id.clone(),
                &resolved.item,
            );
            self.store.put_record(&record).await
        };
        if let Err(e) = result {
            self.record_failure(&resolved.item, &e.to_string());
        }
    }

    fn record_failure(&self, item: &PreferenceItem, error: &str) {
        warn!(
            category = %item.category,
            key = %item.resource_key,
            error,
            "applied item record could not be updated"
        );
        self.emitter.item(
            Level::Warn,
            DiagnosticKind::RecordWriteFailed,
            (item.category, &item.resource_key, item.action),
            "applied item record could not be updated; the change stands",
            Some(error),
        );
    }

    /// Attempt loop: transient errors retry with backoff, others stop.
    pub(crate) async fn apply_with_retry(&self, item: &PreferenceItem) -> (Result<ApplyResult, HandlerError>, u32) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.attempt(item).await {
                Ok(result) => {
                    debug!(
                        handler = self.registration.name(),
                        key = %item.resource_key,
                        change = %result.change,
                        attempts,
                        "item applied"
                    );
                    return (Ok(result), attempts);
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempts - 1) => {
                    let delay = self.retry.delay(attempts - 1);
                    warn!(
                        handler = self.registration.name(),
                        key = %item.resource_key,
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempts),
            }
        }
    }

    /// One read-then-apply. Async handlers run on their own task under the
    /// item timeout; a timed-out task is aborted and awaited before the
    /// attempt returns, so it can never write after a later attempt.
    async fn attempt(&self, item: &PreferenceItem) -> Result<ApplyResult, HandlerError> {
        match self.registration.mode() {
            ExecutionMode::Sync => read_and_apply(self.registration.clone(), item.clone()).await,
            ExecutionMode::Async => {
                let mut task = tokio::spawn(read_and_apply(self.registration.clone(), item.clone()));
                match tokio::time::timeout(self.timeout, &mut task).await {
                    Ok(joined) => joined.unwrap_or_else(|e| Err(join_failure(e))),
                    Err(_) => {
                        task.abort();
                        match task.await {
                            // Finished before the abort landed.
                            Ok(result) => result,
                            Err(e) if e.is_cancelled() => Err(HandlerError::Timeout(self.timeout)),
                            Err(e) => Err(join_failure(e)),
                        }
                    }
                }
            }
        }
    }

    /// Run a handler's batch in resolution order, or with bounded parallelism
    /// when the handler allows concurrent writes.
    pub(crate) async fn run_batch(
        &self,
        items: Vec<ResolvedItem>,
        cancel: &CancelToken,
        max_parallel: usize,
    ) -> Vec<ItemReport> {
        if !self.registration.concurrent_writes() || max_parallel <= 1 {
            let mut reports = Vec::with_capacity(items.len());
            for resolved in items {
                if cancel.is_cancelled() {
                    reports.push(self.cancelled(&resolved));
                } else {
                    reports.push(self.execute(resolved).await);
                }
            }
            return reports;
        }

        let placeholders: Vec<ItemReport> = items
            .iter()
            .map(|r| {
                unattempted(r, ItemOutcome::FailedPermanent).with_error("handler task panicked")
            })
            .collect();
        let mut reports: Vec<Option<ItemReport>> = vec![None; items.len()];
        let mut pending = items.into_iter().enumerate();
        let mut running = JoinSet::new();
        loop {
            while running.len() < max_parallel {
                let Some((index, resolved)) = pending.next() else {
                    break;
                };
                if cancel.is_cancelled() {
                    reports[index] = Some(self.cancelled(&resolved));
                    continue;
                }
                let executor = self.clone();
                running.spawn(async move { (index, executor.execute(resolved).await) });
            }
            match running.join_next().await {
                Some(Ok((index, report))) => reports[index] = Some(report),
                Some(Err(e)) => warn!(handler = self.registration.name(), error = %e, "item task failed"),
                None => break,
            }
        }

        reports
            .into_iter()
            .zip(placeholders)
            .map(|(report, placeholder)| report.unwrap_or(placeholder))
            .collect()
    }

    fn cancelled(&self, resolved: &ResolvedItem) -> ItemReport {
        let report = unattempted(resolved, ItemOutcome::Cancelled);
        self.emitter.outcome(&report);
        report
    }
}

async fn read_and_apply(registration: Registration, item: PreferenceItem) -> Result<ApplyResult, HandlerError> {
    let handler = registration.handler();
    let current = match handler.read(&item.resource_key).await {
        Ok(state) => Some(state),
        Err(HandlerError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    apply_current(&registration, &item, current).await
}

async fn apply_current(
    registration: &Registration,
    item: &PreferenceItem,
    current: Option<ResourceState>,
) -> Result<ApplyResult, HandlerError> {
    match registration.handler().apply(item, current.as_ref()).await {
        // The resource vanished between read and apply.
        Err(HandlerError::NotFound(key)) => Err(HandlerError::Permanent(format!(
            "resource {} disappeared during apply",
            key
        ))),
        other => other,
    }
}

fn join_failure(error: tokio::task::JoinError) -> HandlerError {
    HandlerError::Permanent(format!("handler task failed: {}", error))
}

fn failure_outcome(error: &HandlerError) -> ItemOutcome {
    if error.is_transient() {
        ItemOutcome::FailedTransientExhausted
    } else {
        ItemOutcome::FailedPermanent
    }
}
