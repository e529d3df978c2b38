//! Diagnostics sinks.
//!
//! Sinks receive every [`DiagnosticRecord`] the engine produces. `emit` is
//! synchronous and must be safe to call from many cycles at once.

use crate::config::EngineConfig;
use converge_core::{
    Action, Category, CycleId, DiagnosticKind, DiagnosticRecord, ItemOutcome, ItemReport, Level,
    TargetId,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Append-only consumer of diagnostic records.
pub trait DiagnosticsSink: Send + Sync {
    /// Record one event.
    fn emit(&self, record: DiagnosticRecord);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the most recent records in memory.
pub struct MemorySink {
    retention: usize,
    records: Mutex<VecDeque<DiagnosticRecord>>,
}

impl MemorySink {
    /// Keep at most `retention` records; older ones are dropped.
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Retention taken from `diagnostics_retention`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.diagnostics_retention)
    }

    /// Retained records of one cycle, oldest first.
    pub fn for_cycle(&self, cycle_id: CycleId) -> Vec<DiagnosticRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.cycle_id == cycle_id)
            .cloned()
            .collect()
    }

    /// Snapshot of the retained records, oldest first.
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        lock(&self.records).iter().cloned().collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }
}

impl DiagnosticsSink for MemorySink {
    fn emit(&self, record: DiagnosticRecord) {
        if self.retention == 0 {
            return;
        }
        let mut records = lock(&self.records);
        while records.len() >= self.retention {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Forwards records as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn emit(&self, record: DiagnosticRecord) {
        let category = record.category.map(|c| c.as_str()).unwrap_or("-");
        let key = record.resource_key.as_deref().unwrap_or("-");
        let outcome = record.outcome.map(|o| o.as_str()).unwrap_or("-");
        let error = record.error_detail.as_deref().unwrap_or("");
        macro_rules! forward {
            ($level:ident) => {
                tracing::$level!(
                    cycle_id = %record.cycle_id,
                    target_id = %record.target_id,
                    kind = ?record.kind,
                    category,
                    key,
                    outcome,
                    error,
                    "{}",
                    record.message
                )
            };
        }
        match record.level {
            Level::Debug => forward!(debug),
            Level::Info => forward!(info),
            Level::Warn => forward!(warn),
            Level::Error => forward!(error),
        }
    }
}

enum Line {
    Record(String),
    Flush(oneshot::Sender<()>),
}

/// Appends one JSON object per line to a file.
///
/// Records are queued by `emit` and written by a background task, so
/// emitting never blocks a runtime thread. Call [`JsonLinesSink::flush`]
/// before exiting to wait for queued lines.
pub struct JsonLinesSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Line>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it and its directory if needed.
    /// Spawns the writer task on the current runtime.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(path.clone(), file, rx));
        Ok(Self { path, tx })
    }

    /// File written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every record emitted so far is written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Line::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn write_lines(path: PathBuf, mut file: fs::File, mut rx: mpsc::UnboundedReceiver<Line>) {
    while let Some(line) = rx.recv().await {
        match line {
            Line::Record(text) => {
                if let Err(e) = file.write_all(text.as_bytes()).await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to append diagnostic record");
                }
            }
            Line::Flush(ack) => {
                if let Err(e) = file.flush().await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to flush diagnostics");
                }
                let _ = ack.send(());
            }
        }
    }
}

impl DiagnosticsSink for JsonLinesSink {
    fn emit(&self, record: DiagnosticRecord) {
        let mut text = match serde_json::to_string(&record) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize diagnostic record");
                return;
            }
        };
        text.push('\n');
        if self.tx.send(Line::Record(text)).is_err() {
            tracing::warn!(path = %self.path.display(), "diagnostics writer stopped, record dropped");
        }
    }
}

/// Sends each record to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DiagnosticsSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl DiagnosticsSink for FanoutSink {
    fn emit(&self, record: DiagnosticRecord) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(record.clone());
            }
            last.emit(record);
        }
    }
}

/// Builds records for one cycle.
#[derive(Clone)]
pub(crate) struct CycleEmitter {
    sink: Arc<dyn DiagnosticsSink>,
    cycle_id: CycleId,
    target: TargetId,
}

impl CycleEmitter {
    pub(crate) fn new(sink: Arc<dyn DiagnosticsSink>, cycle_id: CycleId, target: TargetId) -> Self {
        Self {
            sink,
            cycle_id,
            target,
        }
    }

    pub(crate) fn cycle(&self, level: Level, kind: DiagnosticKind, message: impl Into<String>) {
        self.sink.emit(DiagnosticRecord::new(
            self.cycle_id,
            self.target.clone(),
            level,
            kind,
            message,
        ));
    }

    pub(crate) fn item(
        &self,
        level: Level,
        kind: DiagnosticKind,
        (category, key, action): (Category, &str, Action),
        message: impl Into<String>,
        error: Option<&str>,
    ) {
        let mut record =
            DiagnosticRecord::new(self.cycle_id, self.target.clone(), level, kind, message)
                .with_item(category, key, action);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        self.sink.emit(record);
    }

    pub(crate) fn outcome(&self, report: &ItemReport) {
        let level = match report.outcome {
            ItemOutcome::FailedPermanent | ItemOutcome::FailedTransientExhausted => Level::Error,
            ItemOutcome::Cancelled => Level::Warn,
            ItemOutcome::Applied | ItemOutcome::Removed => Level::Info,
            _ => Level::Debug,
        };
        let mut record = DiagnosticRecord::new(
            self.cycle_id,
            self.target.clone(),
            level,
            DiagnosticKind::ItemOutcome,
            format!(
                "{}:{} {} after {} attempt(s)",
                report.category, report.resource_key, report.outcome, report.attempts
            ),
        )
        .with_item(report.category, report.resource_key.clone(), report.action)
        .with_outcome(report.outcome);
        if let Some(error) = &report.error {
            record = record.with_error(error.clone());
        }
        self.sink.emit(record);
    }
}
