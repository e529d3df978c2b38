//! End-to-end cycles against scripted handlers.

use async_trait::async_trait;
use converge_core::{
    Action, AppliedItemRecord, ApplyPolicy, BundleId, Category, Change, DiagnosticKind, Expr,
    FactValue, Facts, ItemOutcome, PolicyBundle, PreferenceItem, ProcessingCycle, RecordKey,
    TargetId,
};
use converge_execution::{
    BackoffStrategy, CancelHandle, ConvergenceEngine, EngineConfig, MemorySink, RetryConfig,
    RunOptions,
};
use converge_handlers::{
    plan_change, ApplyResult, ExecutionMode, FileHandler, HandlerError, HandlerRegistry,
    KeyValueHandler, Plan, ResourceHandler, ResourceState,
};
use converge_storage::{JsonStateStore, MemoryStateStore, StateStore, StorageError};
use converge_targeting::StaticFactProvider;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory handler whose failures and delays are scripted per key.
struct ScriptedHandler {
    category: Category,
    mode: ExecutionMode,
    concurrent: bool,
    state: Mutex<HashMap<String, Value>>,
    transient: Mutex<HashMap<String, u32>>,
    permanent: HashSet<String>,
    delays: Mutex<HashMap<String, VecDeque<Duration>>>,
    cancel_on_apply: Option<Arc<CancelHandle>>,
    applies: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedHandler {
    fn new(category: Category) -> Self {
        Self {
            category,
            mode: ExecutionMode::Sync,
            concurrent: false,
            state: Mutex::new(HashMap::new()),
            transient: Mutex::new(HashMap::new()),
            permanent: HashSet::new(),
            delays: Mutex::new(HashMap::new()),
            cancel_on_apply: None,
            applies: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn asynchronous(mut self) -> Self {
        self.mode = ExecutionMode::Async;
        self
    }

    fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    fn seeded(self, key: &str, value: Value) -> Self {
        self.state.lock().unwrap().insert(key.to_string(), value);
        self
    }

    fn failing_transiently(self, key: &str, times: u32) -> Self {
        self.transient.lock().unwrap().insert(key.to_string(), times);
        self
    }

    fn failing_permanently(mut self, key: &str) -> Self {
        self.permanent.insert(key.to_string());
        self
    }

    fn delayed(self, key: &str, delays: &[u64]) -> Self {
        self.delays.lock().unwrap().insert(
            key.to_string(),
            delays.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        );
        self
    }

    fn cancelling(mut self, handle: Arc<CancelHandle>) -> Self {
        self.cancel_on_apply = Some(handle);
        self
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().get(key).cloned()
    }

    fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandler for ScriptedHandler {
    fn category(&self) -> Category {
        self.category
    }

    fn name(&self) -> &str {
        self.category.as_str()
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn concurrent_writes(&self) -> bool {
        self.concurrent
    }

    async fn read(&self, key: &str) -> Result<ResourceState, HandlerError> {
        self.value(key)
            .map(|value| ResourceState::new(key, value))
            .ok_or_else(|| HandlerError::NotFound(key.to_string()))
    }

    async fn apply(
        &self,
        item: &PreferenceItem,
        current: Option<&ResourceState>,
    ) -> Result<ApplyResult, HandlerError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlight::enter(&self.in_flight);
        self.max_in_flight.fetch_max(in_flight.now, Ordering::SeqCst);

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get_mut(&item.resource_key)
            .and_then(|d| d.pop_front());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        drop(in_flight);

        if let Some(handle) = &self.cancel_on_apply {
            handle.cancel();
        }
        if self.permanent.contains(&item.resource_key) {
            return Err(HandlerError::Permanent(format!("{} is locked", item.resource_key)));
        }
        if let Some(left) = self.transient.lock().unwrap().get_mut(&item.resource_key) {
            if *left > 0 {
                *left -= 1;
                return Err(HandlerError::Transient(format!("{} is busy", item.resource_key)));
            }
        }

        let plan = plan_change(item, current, true)?;
        let change = plan.change();
        let mut state = self.state.lock().unwrap();
        match plan {
            Plan::Write { value, .. } => {
                state.insert(item.resource_key.clone(), value);
            }
            Plan::Remove => {
                state.remove(&item.resource_key);
            }
            Plan::Noop => {}
        }
        Ok(ApplyResult::new(change))
    }
}

/// Counts an apply as in flight until dropped, including when its task is aborted.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    now: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, now }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State store whose reads fail.
struct UnreadableStore {
    inner: MemoryStateStore,
}

#[async_trait]
impl StateStore for UnreadableStore {
    async fn get_record(&self, _key: &RecordKey) -> Result<Option<AppliedItemRecord>, StorageError> {
        Err(StorageError::Other("disk unavailable".into()))
    }

    async fn put_record(&self, record: &AppliedItemRecord) -> Result<(), StorageError> {
        self.inner.put_record(record).await
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.inner.delete_record(key).await
    }

    async fn list_records(&self, _target: &TargetId) -> Result<Vec<AppliedItemRecord>, StorageError> {
        Err(StorageError::Other("disk unavailable".into()))
    }

    async fn list_targets(&self) -> Result<Vec<TargetId>, StorageError> {
        self.inner.list_targets().await
    }
}

fn target(name: &str) -> TargetId {
    TargetId::new(name).unwrap()
}

fn facts() -> Facts {
    let mut facts = Facts::new();
    facts.insert("site".into(), FactValue::Text("hq".into()));
    facts.insert("os.version".into(), FactValue::Text("10.0.19045".into()));
    facts
}

fn fact_provider(targets: &[&str]) -> Arc<StaticFactProvider> {
    Arc::new(
        targets
            .iter()
            .fold(StaticFactProvider::new(), |p, t| p.with_target(target(t), facts())),
    )
}

fn bundle(id: &str, precedence: i64, items: Vec<PreferenceItem>) -> PolicyBundle {
    items
        .into_iter()
        .fold(PolicyBundle::new(BundleId::new(id).unwrap(), precedence), |b, i| {
            b.with_item(i)
        })
}

fn item(category: Category, key: &str, action: Action, payload: Value) -> PreferenceItem {
    PreferenceItem::new(category, key, action, payload)
}

fn fast_retries(max_retries: u32) -> EngineConfig {
    EngineConfig::new().with_retry(RetryConfig {
        max_retries,
        strategy: BackoffStrategy::Fixed,
        base_delay_ms: 5,
        max_delay_ms: 5,
    })
}

struct Harness {
    engine: ConvergenceEngine,
    store: Arc<MemoryStateStore>,
    sink: Arc<MemorySink>,
}

fn harness(handlers: Vec<Arc<ScriptedHandler>>, config: EngineConfig, targets: &[&str]) -> Harness {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(handler).unwrap();
    }
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::new(1000));
    let engine = ConvergenceEngine::new(registry, store.clone(), fact_provider(targets))
        .with_config(config)
        .with_sink(sink.clone());
    Harness { engine, store, sink }
}

fn outcome(cycle: &ProcessingCycle, key: &str) -> ItemOutcome {
    cycle
        .items()
        .find(|r| r.resource_key == key)
        .map(|r| r.outcome)
        .unwrap()
}

#[tokio::test]
async fn test_higher_precedence_wins() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let bundles = vec![
        bundle("base", 10, vec![item(Category::Registry, "Theme", Action::Replace, json!({"v": "light"}))]),
        bundle("site", 20, vec![item(Category::Registry, "Theme", Action::Replace, json!({"v": "dark"}))]),
    ];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    assert_eq!(kv.value("Theme"), Some(json!({"v": "dark"})));
    assert_eq!(cycle.conflicts.len(), 1);
    assert_eq!(cycle.conflicts[0].winner.as_str(), "site");
    assert_eq!(cycle.conflicts[0].shadowed[0].as_str(), "base");
    let report = cycle.items().next().unwrap();
    assert_eq!(report.bundle_id.as_str(), "site");
    assert_eq!(report.change, Some(Change::Created));
}

#[tokio::test]
async fn test_create_over_different_value_is_noop() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).seeded("Theme", json!({"v": "light"})));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "Theme", Action::Create, json!({"v": "dark"}))],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    let report = cycle.items().next().unwrap();
    assert_eq!(report.outcome, ItemOutcome::Applied);
    assert_eq!(report.change, Some(Change::Unchanged));
    assert_eq!(kv.value("Theme"), Some(json!({"v": "light"})));
}

#[tokio::test]
async fn test_delete_of_absent_resource_is_noop() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "Old", Action::Delete, Value::Null)],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    let report = cycle.items().next().unwrap();
    assert_eq!(report.outcome, ItemOutcome::Applied);
    assert_eq!(report.change, Some(Change::Unchanged));
    let key = RecordKey::new(target("pc-1"), Category::Registry, "Old");
    assert!(h.store.get_record(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_apply_once_skips_second_cycle() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let once = item(Category::Registry, "Welcome", Action::Replace, json!({"shown": true})).apply_once();
    let bundles = vec![bundle("base", 0, vec![once.clone()])];

    let first = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();
    assert_eq!(outcome(&first, "Welcome"), ItemOutcome::Applied);

    let second = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();
    assert_eq!(outcome(&second, "Welcome"), ItemOutcome::SkippedApplyOnce);
    assert_eq!(kv.applies(), 1);

    let record = h
        .store
        .get_record(&RecordKey::new(target("pc-1"), Category::Registry, "Welcome"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.apply_policy, ApplyPolicy::ApplyOnceThenIgnore);
    assert_eq!(record.fingerprint, once.fingerprint());

    // A changed payload is a new fingerprint and applies again.
    let changed = item(Category::Registry, "Welcome", Action::Replace, json!({"shown": false})).apply_once();
    let third = h
        .engine
        .run_cycle(&target("pc-1"), &[bundle("base", 0, vec![changed])], &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome(&third, "Welcome"), ItemOutcome::Applied);
    assert_eq!(kv.applies(), 2);
}

#[tokio::test]
async fn test_timing_out_share_is_retried_while_files_complete() {
    let files = Arc::new(ScriptedHandler::new(Category::File).concurrent());
    let shares = Arc::new(
        ScriptedHandler::new(Category::Share)
            .asynchronous()
            .delayed("docs", &[500]),
    );
    let config = fast_retries(2).with_item_timeout(Duration::from_millis(50));
    let h = harness(vec![files.clone(), shares.clone()], config, &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![
            item(Category::File, "a.txt", Action::Replace, json!({"content": "a"})),
            item(Category::Share, "docs", Action::Replace, json!({"path": "/srv/docs"})),
            item(Category::File, "b.txt", Action::Replace, json!({"content": "b"})),
        ],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    assert_eq!(outcome(&cycle, "a.txt"), ItemOutcome::Applied);
    assert_eq!(outcome(&cycle, "b.txt"), ItemOutcome::Applied);
    let share = cycle.items().find(|r| r.resource_key == "docs").unwrap();
    assert_eq!(share.outcome, ItemOutcome::Applied);
    assert_eq!(share.attempts, 2);
    assert_eq!(shares.value("docs"), Some(json!({"path": "/srv/docs"})));
}

#[tokio::test]
async fn test_timed_out_apply_never_lands_after_a_later_cycle() {
    let shares = Arc::new(
        ScriptedHandler::new(Category::Share)
            .asynchronous()
            .delayed("docs", &[300]),
    );
    let config = fast_retries(1).with_item_timeout(Duration::from_millis(50));
    let h = harness(vec![shares.clone()], config, &["pc-1"]);
    let v1 = item(Category::Share, "docs", Action::Replace, json!({"path": "/v1"}));
    let v2 = item(Category::Share, "docs", Action::Replace, json!({"path": "/v2"}));

    let first = h
        .engine
        .run_cycle(&target("pc-1"), &[bundle("base", 0, vec![v1])], &RunOptions::default())
        .await
        .unwrap();
    let report = first.items().next().unwrap();
    assert_eq!(report.outcome, ItemOutcome::Applied);
    assert_eq!(report.attempts, 2);
    assert_eq!(shares.in_flight.load(Ordering::SeqCst), 0);

    let second = h
        .engine
        .run_cycle(&target("pc-1"), &[bundle("base", 0, vec![v2.clone()])], &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome(&second, "docs"), ItemOutcome::Applied);

    // Outlast the first attempt's delay.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(shares.value("docs"), Some(json!({"path": "/v2"})));
    let record = h
        .store
        .get_record(&RecordKey::new(target("pc-1"), Category::Share, "docs"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.fingerprint, v2.fingerprint());
}

#[tokio::test]
async fn test_share_that_always_times_out_exhausts_retries() {
    let shares = Arc::new(
        ScriptedHandler::new(Category::Share)
            .asynchronous()
            .delayed("docs", &[300, 300, 300]),
    );
    let config = fast_retries(2).with_item_timeout(Duration::from_millis(20));
    let h = harness(vec![shares], config, &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Share, "docs", Action::Replace, json!({"path": "/srv/docs"}))],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    let report = cycle.items().next().unwrap();
    assert_eq!(report.outcome, ItemOutcome::FailedTransientExhausted);
    assert_eq!(report.attempts, 3);
    assert!(report.error.as_deref().unwrap().contains("timed out"));
    let key = RecordKey::new(target("pc-1"), Category::Share, "docs");
    assert!(h.store.get_record(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_transient_failures_recover_within_budget() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).failing_transiently("Flaky", 2));
    let h = harness(vec![kv.clone()], fast_retries(3), &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "Flaky", Action::Replace, json!({"v": 1}))],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    let report = cycle.items().next().unwrap();
    assert_eq!(report.outcome, ItemOutcome::Applied);
    assert_eq!(report.attempts, 3);
}

#[tokio::test]
async fn test_failure_is_isolated_to_its_item() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).failing_permanently("Locked"));
    let files = Arc::new(ScriptedHandler::new(Category::File));
    let h = harness(vec![kv.clone(), files.clone()], fast_retries(3), &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![
            item(Category::Registry, "Locked", Action::Replace, json!({"v": 1})),
            item(Category::Registry, "Open", Action::Replace, json!({"v": 2})),
            item(Category::File, "a.txt", Action::Replace, json!({"content": "a"})),
        ],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    let locked = cycle.items().find(|r| r.resource_key == "Locked").unwrap();
    assert_eq!(locked.outcome, ItemOutcome::FailedPermanent);
    assert_eq!(locked.attempts, 1);
    assert!(locked.error.as_deref().unwrap().contains("locked"));
    assert_eq!(outcome(&cycle, "Open"), ItemOutcome::Applied);
    assert_eq!(outcome(&cycle, "a.txt"), ItemOutcome::Applied);
    assert!(!cycle.success());

    let summary = cycle.summary();
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.failed_permanent, 1);

    let errors = h
        .sink
        .records()
        .into_iter()
        .filter(|r| r.error_detail.is_some())
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_unlinked_items_are_removed_or_kept() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let linked = vec![bundle(
        "base",
        0,
        vec![
            item(Category::Registry, "Temp", Action::Replace, json!({"v": 1})).with_remove_on_unlink(),
            item(Category::Registry, "Sticky", Action::Replace, json!({"v": 2})),
        ],
    )];
    h.engine.run_cycle(&target("pc-1"), &linked, &RunOptions::default()).await.unwrap();

    let cycle = h.engine.run_cycle(&target("pc-1"), &[], &RunOptions::default()).await.unwrap();

    assert_eq!(cycle.unlinked.len(), 1);
    assert_eq!(cycle.unlinked[0].resource_key, "Temp");
    assert_eq!(cycle.unlinked[0].outcome, ItemOutcome::Removed);
    assert_eq!(cycle.unlinked[0].change, Some(Change::Deleted));
    assert_eq!(kv.value("Temp"), None);
    assert_eq!(kv.value("Sticky"), Some(json!({"v": 2})));

    let remaining = h.store.list_records(&target("pc-1")).await.unwrap();
    let keys: Vec<&str> = remaining.iter().map(|r| r.resource_key.as_str()).collect();
    assert_eq!(keys, vec!["Sticky"]);
}

#[tokio::test]
async fn test_failed_unlink_keeps_record_for_next_cycle() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).failing_transiently("Temp", 0));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let linked = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "Temp", Action::Replace, json!({"v": 1})).with_remove_on_unlink()],
    )];
    h.engine.run_cycle(&target("pc-1"), &linked, &RunOptions::default()).await.unwrap();

    kv.transient.lock().unwrap().insert("Temp".into(), 1);
    let failed = h.engine.run_cycle(&target("pc-1"), &[], &RunOptions::default()).await.unwrap();
    assert_eq!(failed.unlinked[0].outcome, ItemOutcome::FailedTransientExhausted);
    assert_eq!(h.store.list_records(&target("pc-1")).await.unwrap().len(), 1);

    let retried = h.engine.run_cycle(&target("pc-1"), &[], &RunOptions::default()).await.unwrap();
    assert_eq!(retried.unlinked[0].outcome, ItemOutcome::Removed);
    assert!(h.store.list_records(&target("pc-1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let linked = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "Temp", Action::Replace, json!({"v": 1})).with_remove_on_unlink()],
    )];
    h.engine.run_cycle(&target("pc-1"), &linked, &RunOptions::default()).await.unwrap();
    let applies = kv.applies();

    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "New", Action::Replace, json!({"v": 2}))],
    )];
    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::dry_run()).await.unwrap();

    assert!(cycle.dry_run);
    assert_eq!(outcome(&cycle, "New"), ItemOutcome::WouldApply);
    assert_eq!(cycle.unlinked[0].outcome, ItemOutcome::WouldRemove);
    assert_eq!(kv.applies(), applies);
    assert_eq!(kv.value("New"), None);
    assert_eq!(kv.value("Temp"), Some(json!({"v": 1})));
    let keys: Vec<String> = h
        .store
        .list_records(&target("pc-1"))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.resource_key)
        .collect();
    assert_eq!(keys, vec!["Temp".to_string()]);
}

#[tokio::test]
async fn test_cancellation_stops_between_items_and_skips_cleanup() {
    let handle = Arc::new(CancelHandle::new());
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).cancelling(handle.clone()));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);

    // Seed an unlinkable record without cancelling.
    let store = h.store.clone();
    let seed = PreferenceItem::new(Category::Registry, "Temp", Action::Replace, json!({"v": 0}))
        .with_remove_on_unlink();
    store
        .put_record(&AppliedItemRecord::for_item(
            target("pc-1"),
            BundleId::new("old").unwrap(),
            &seed,
        ))
        .await
        .unwrap();

    let bundles = vec![bundle(
        "base",
        0,
        vec![
            item(Category::Registry, "First", Action::Replace, json!({"v": 1})),
            item(Category::Registry, "Second", Action::Replace, json!({"v": 2})),
            item(Category::Registry, "Third", Action::Replace, json!({"v": 3})),
        ],
    )];
    let options = RunOptions::default().with_cancel(handle.token());
    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &options).await.unwrap();

    assert!(cycle.cancelled);
    assert_eq!(outcome(&cycle, "First"), ItemOutcome::Applied);
    assert_eq!(outcome(&cycle, "Second"), ItemOutcome::Cancelled);
    assert_eq!(outcome(&cycle, "Third"), ItemOutcome::Cancelled);
    assert_eq!(kv.applies(), 1);
    assert!(cycle.unlinked.is_empty());
    let key = RecordKey::new(target("pc-1"), Category::Registry, "Temp");
    assert!(store.get_record(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_writes_are_bounded_and_ordered() {
    let mut files = ScriptedHandler::new(Category::File).concurrent();
    let keys: Vec<String> = (0..8).map(|i| format!("f{}.txt", i)).collect();
    for key in &keys {
        files = files.delayed(key, &[30]);
    }
    let files = Arc::new(files);
    let h = harness(vec![files.clone()], fast_retries(0).with_max_parallel_items(3), &["pc-1"]);
    let items = keys
        .iter()
        .map(|k| item(Category::File, k, Action::Replace, json!({"content": k})))
        .collect();

    let cycle = h
        .engine
        .run_cycle(&target("pc-1"), &[bundle("base", 0, items)], &RunOptions::default())
        .await
        .unwrap();

    let reported: Vec<&str> = cycle.items().map(|r| r.resource_key.as_str()).collect();
    assert_eq!(reported, keys.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(cycle.items().all(|r| r.outcome == ItemOutcome::Applied));
    assert!(files.max_in_flight() <= 3);
    assert!(files.max_in_flight() > 1);
}

#[tokio::test]
async fn test_sequential_handler_never_overlaps() {
    let mut kv = ScriptedHandler::new(Category::Registry);
    for key in ["A", "B", "C"] {
        kv = kv.delayed(key, &[20]);
    }
    let kv = Arc::new(kv);
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let items = ["A", "B", "C"]
        .iter()
        .map(|k| item(Category::Registry, k, Action::Replace, json!({"v": k})))
        .collect();

    h.engine
        .run_cycle(&target("pc-1"), &[bundle("base", 0, items)], &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(kv.max_in_flight(), 1);
}

#[tokio::test]
async fn test_same_target_cycles_are_serialized() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).delayed("A", &[50, 50]));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "A", Action::Replace, json!({"v": 1}))],
    )];
    let options = RunOptions::default();

    let target_a = target("pc-1");
    let target_b = target("pc-1");
    let (a, b) = tokio::join!(
        h.engine.run_cycle(&target_a, &bundles, &options),
        h.engine.run_cycle(&target_b, &bundles, &options),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(kv.applies(), 2);
    assert_eq!(kv.max_in_flight(), 1);
}

#[tokio::test]
async fn test_distinct_targets_run_in_parallel() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry).delayed("A", &[100, 100]));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1", "pc-2"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "A", Action::Replace, json!({"v": 1}))],
    )];

    let results = h
        .engine
        .run_many(&[target("pc-1"), target("pc-2")], &bundles, &RunOptions::default())
        .await;

    assert_eq!(results.len(), 2);
    for (_, result) in &results {
        assert_eq!(result.as_ref().unwrap().summary().applied, 1);
    }
    assert_eq!(kv.max_in_flight(), 2);
    for t in ["pc-1", "pc-2"] {
        assert_eq!(h.store.list_records(&target(t)).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_targeting_selects_items_per_target() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let h = harness(vec![kv.clone()], fast_retries(0), &["pc-1"]);
    let bundles = vec![bundle(
        "base",
        0,
        vec![
            item(Category::Registry, "Modern", Action::Replace, json!({"v": 1}))
                .with_targeting(Expr::parse("os.version >= 10.0 and site == HQ").unwrap()),
            item(Category::Registry, "Legacy", Action::Replace, json!({"v": 2}))
                .with_targeting(Expr::parse("os.version < 6.3").unwrap()),
            item(Category::Registry, "Battery", Action::Replace, json!({"v": 3}))
                .with_targeting(Expr::parse("on_battery exists").unwrap()),
        ],
    )];

    let cycle = h.engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();

    let keys: Vec<&str> = cycle.items().map(|r| r.resource_key.as_str()).collect();
    assert_eq!(keys, vec!["Modern"]);
}

#[tokio::test]
async fn test_real_handlers_with_json_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path().join("state")).await.unwrap());
    let mut registry = HandlerRegistry::new();
    registry
        .register(Arc::new(KeyValueHandler::open(dir.path().join("registry.json")).await.unwrap()))
        .unwrap();
    registry
        .register(Arc::new(FileHandler::new(dir.path().join("files"))))
        .unwrap();
    let engine = ConvergenceEngine::new(registry, store.clone(), fact_provider(&["pc-1"]));
    let bundles = vec![bundle(
        "base",
        0,
        vec![
            item(Category::Registry, "HKCU\\App", Action::Update, json!({"Zoom": 120})),
            item(Category::File, "etc/motd", Action::Create, json!({"content": "hi"})),
        ],
    )];

    let first = engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();
    assert_eq!(first.summary().applied, 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("files/etc/motd")).unwrap(),
        "hi"
    );

    let second = engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();
    assert!(second.items().all(|r| r.change == Some(Change::Unchanged)));
    assert_eq!(store.list_records(&target("pc-1")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_save_fails_item_and_is_retried_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("resources");
    let kv = Arc::new(KeyValueHandler::open(blocker.join("registry.json")).await.unwrap());
    let mut registry = HandlerRegistry::new();
    registry.register(kv.clone()).unwrap();
    let store = Arc::new(MemoryStateStore::new());
    let engine = ConvergenceEngine::new(registry, store.clone(), fact_provider(&["pc-1"]))
        .with_config(fast_retries(2));
    let bundles = vec![bundle(
        "base",
        0,
        vec![item(Category::Registry, "HKCU\\App", Action::Replace, json!({"Zoom": 120}))],
    )];
    std::fs::write(&blocker, "").unwrap();

    let failed = engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();
    assert_eq!(outcome(&failed, "HKCU\\App"), ItemOutcome::FailedPermanent);
    assert!(store.is_empty().await);
    assert!(kv.read("HKCU\\App").await.is_err());

    std::fs::remove_file(&blocker).unwrap();
    let retried = engine.run_cycle(&target("pc-1"), &bundles, &RunOptions::default()).await.unwrap();
    let report = retried.items().next().unwrap();
    assert_eq!(report.outcome, ItemOutcome::Applied);
    assert_eq!(report.change, Some(Change::Created));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_unreadable_records_are_reported_as_read_failures() {
    let kv = Arc::new(ScriptedHandler::new(Category::Registry));
    let mut registry = HandlerRegistry::new();
    registry.register(kv.clone()).unwrap();
    let store = Arc::new(UnreadableStore {
        inner: MemoryStateStore::new(),
    });
    let sink = Arc::new(MemorySink::new(100));
    let engine = ConvergenceEngine::new(registry, store, fact_provider(&["pc-1"]))
        .with_config(fast_retries(0))
        .with_sink(sink.clone());
    let once = item(Category::Registry, "Welcome", Action::Replace, json!({"shown": true})).apply_once();

    let cycle = engine
        .run_cycle(&target("pc-1"), &[bundle("base", 0, vec![once])], &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome(&cycle, "Welcome"), ItemOutcome::Applied);
    let kinds: Vec<DiagnosticKind> = sink.records().into_iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == DiagnosticKind::RecordReadFailed).count(),
        2
    );
    assert!(!kinds.contains(&DiagnosticKind::RecordWriteFailed));
}
