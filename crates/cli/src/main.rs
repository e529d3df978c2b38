//! Converge CLI - declarative configuration convergence.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use converge_core::{AppliedItemRecord, ItemReport, PolicyBundle, ProcessingCycle, TargetId};
use converge_execution::{
    CancelHandle, ConvergenceEngine, CycleError, EngineConfig, FanoutSink, JsonLinesSink,
    MemorySink, RunOptions, TracingSink,
};
use converge_handlers::{FileHandler, HandlerRegistry, KeyValueHandler, ShareHandler};
use converge_resolver::{validate_bundles, BundleSource, DirectoryBundleSource};
use converge_storage::{JsonStateStore, StateStore};
use converge_targeting::JsonFactProvider;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Converge targets towards declared policy bundles", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Working directory holding bundles, facts, state and resources
    #[arg(long, global = true, default_value = ".converge")]
    root: PathBuf,

    /// Bundle directory [default: <root>/bundles]
    #[arg(long, global = true)]
    bundles: Option<PathBuf>,

    /// Fact directory, one <target>.json per target [default: <root>/facts]
    #[arg(long, global = true)]
    facts: Option<PathBuf>,

    /// Applied item records [default: <root>/state]
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Managed resources [default: <root>/resources]
    #[arg(long, global = true)]
    resources: Option<PathBuf>,

    /// Diagnostics log, JSON lines [default: <root>/diagnostics.jsonl]
    #[arg(long, global = true)]
    diagnostics: Option<PathBuf>,

    /// Engine configuration [default: <root>/config.json if present]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Override retry.max_retries
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Override item_timeout_ms
    #[arg(long, global = true)]
    item_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a processing cycle for one or more targets
    RunCycle {
        /// Target to converge (repeatable)
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
        /// Report what would change without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Print cycles as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the applied item records of a target
    InspectState {
        /// Target to inspect
        #[arg(long)]
        target: String,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load and validate the bundle set
    Validate,
}

/// Resolved filesystem layout.
struct Paths {
    root: PathBuf,
    bundles: PathBuf,
    facts: PathBuf,
    state: PathBuf,
    resources: PathBuf,
    diagnostics: PathBuf,
}

impl Paths {
    fn from_args(args: &GlobalArgs) -> Self {
        let root = args.root.clone();
        let under = |flag: &Option<PathBuf>, name: &str| flag.clone().unwrap_or_else(|| root.join(name));
        Self {
            bundles: under(&args.bundles, "bundles"),
            facts: under(&args.facts, "facts"),
            state: under(&args.state, "state"),
            resources: under(&args.resources, "resources"),
            diagnostics: under(&args.diagnostics, "diagnostics.jsonl"),
            root,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let paths = Paths::from_args(&cli.global);

    match cli.command {
        Commands::RunCycle { targets, dry_run, json } => {
            let targets = parse_targets(&targets)?;
            let bundles = load_bundles(&paths.bundles).await?;
            let config = load_config(&cli.global, &paths)?;
            let runtime = build_engine(&paths, config).await?;

            let cancel = Arc::new(CancelHandle::new());
            let options = RunOptions {
                dry_run,
                cancel: cancel.token(),
            };
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, cancelling after in-flight items");
                        cancel.cancel();
                    }
                })
            };

            let results = runtime.engine.run_many(&targets, &bundles, &options).await;
            watcher.abort();
            runtime.log.flush().await;

            let fatal = results.iter().any(|(_, r)| r.is_err());
            if json {
                print_cycles_json(&results, &runtime.recent)?;
            } else {
                for (target, result) in &results {
                    match result {
                        Ok(cycle) => print_cycle(cycle),
                        Err(e) => println!("Target {}: aborted: {}\n", target, e),
                    }
                }
            }
            Ok(if fatal { ExitCode::from(2) } else { ExitCode::SUCCESS })
        }
        Commands::InspectState { target, json } => {
            let target = TargetId::new(target).context("invalid target id")?;
            let store = JsonStateStore::new(&paths.state)
                .await
                .with_context(|| format!("opening state store {}", paths.state.display()))?;
            let records = store.list_records(&target).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&target, &records);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            let bundles = load_bundles(&paths.bundles).await?;
            println!("Bundles ({})", bundles.len());
            for bundle in &bundles {
                println!(
                    "  {} | precedence {} | {} item(s){}",
                    bundle.id,
                    bundle.precedence,
                    bundle.items.len(),
                    if bundle.scope.is_always() {
                        String::new()
                    } else {
                        format!(" | scope: {}", bundle.scope)
                    }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn parse_targets(names: &[String]) -> Result<Vec<TargetId>> {
    names
        .iter()
        .map(|name| TargetId::new(name.as_str()).with_context(|| format!("invalid target id {:?}", name)))
        .collect()
}

async fn load_bundles(dir: &Path) -> Result<Vec<PolicyBundle>> {
    let bundles = DirectoryBundleSource::new(dir)
        .load()
        .await
        .with_context(|| format!("loading bundles from {}", dir.display()))?;
    validate_bundles(&bundles).context("invalid bundle set")?;
    debug!(count = bundles.len(), "bundles loaded");
    Ok(bundles)
}

fn load_config(args: &GlobalArgs, paths: &Paths) -> Result<EngineConfig> {
    let default_path = paths.root.join("config.json");
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None if default_path.exists() => EngineConfig::load(&default_path)?,
        None => EngineConfig::default(),
    };
    if let Some(max_retries) = args.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(timeout) = args.item_timeout_ms {
        config.item_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

/// The engine plus the sinks the CLI reads back from.
struct Runtime {
    engine: ConvergenceEngine,
    recent: Arc<MemorySink>,
    log: Arc<JsonLinesSink>,
}

async fn build_engine(paths: &Paths, config: EngineConfig) -> Result<Runtime> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(
        KeyValueHandler::open(paths.resources.join("registry.json")).await?,
    ))?;
    registry.register(Arc::new(FileHandler::new(paths.resources.join("files"))))?;
    registry.register(Arc::new(
        ShareHandler::open(paths.resources.join("shares.json")).await?,
    ))?;

    let store = JsonStateStore::new(&paths.state)
        .await
        .with_context(|| format!("opening state store {}", paths.state.display()))?;
    let log = Arc::new(
        JsonLinesSink::open(&paths.diagnostics)
            .await
            .with_context(|| format!("opening diagnostics log {}", paths.diagnostics.display()))?,
    );
    let recent = Arc::new(MemorySink::from_config(&config));
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(log.clone())
        .with(recent.clone());

    info!(handlers = registry.len(), root = %paths.root.display(), "engine ready");
    let engine = ConvergenceEngine::new(
        registry,
        Arc::new(store),
        Arc::new(JsonFactProvider::new(&paths.facts)),
    )
    .with_config(config)
    .with_sink(Arc::new(sink));
    Ok(Runtime { engine, recent, log })
}

fn print_cycle(cycle: &ProcessingCycle) {
    println!(
        "Target {} | cycle {}{}{}",
        cycle.target,
        cycle.id,
        if cycle.dry_run { " | dry run" } else { "" },
        if cycle.cancelled { " | cancelled" } else { "" },
    );

    let rows: Vec<Vec<String>> = cycle
        .handlers
        .iter()
        .flat_map(|run| run.items.iter().map(move |item| item_row(&run.handler, item)))
        .chain(cycle.unlinked.iter().map(|item| item_row("unlink", item)))
        .collect();
    if rows.is_empty() {
        println!("  (no items)");
    } else {
        print_table(
            &["HANDLER", "CATEGORY", "KEY", "ACTION", "OUTCOME", "CHANGE", "ATTEMPTS", "BUNDLE", "ERROR"],
            &rows,
        );
    }

    if !cycle.conflicts.is_empty() {
        println!("  Conflicts:");
        for conflict in &cycle.conflicts {
            println!("    {}", conflict);
        }
    }
    if !cycle.warnings.is_empty() {
        println!("  Warnings:");
        for warning in &cycle.warnings {
            println!("    {}", warning);
        }
    }
    println!("  Totals: {}\n", cycle.summary());
}

fn item_row(handler: &str, item: &ItemReport) -> Vec<String> {
    vec![
        handler.to_string(),
        item.category.to_string(),
        item.resource_key.clone(),
        item.action.to_string(),
        item.outcome.to_string(),
        item.change.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
        item.attempts.to_string(),
        item.bundle_id.to_string(),
        item.error.clone().unwrap_or_default(),
    ]
}

fn print_cycles_json(
    results: &[(TargetId, Result<ProcessingCycle, CycleError>)],
    recent: &MemorySink,
) -> Result<()> {
    let out: Vec<serde_json::Value> = results
        .iter()
        .map(|(target, result)| match result {
            Ok(cycle) => serde_json::json!({
                "target": target,
                "cycle": cycle,
                "summary": cycle.summary(),
                "diagnostics": recent.for_cycle(cycle.id),
            }),
            Err(e) => serde_json::json!({
                "target": target,
                "error": e.to_string(),
            }),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_records(target: &TargetId, records: &[AppliedItemRecord]) {
    println!("Applied items for {} ({})", target, records.len());
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.category.to_string(),
                r.resource_key.clone(),
                r.action.to_string(),
                r.apply_policy.as_str().to_string(),
                if r.remove_on_unlink { "yes" } else { "no" }.to_string(),
                r.source_bundle_id.to_string(),
                r.applied_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    if !rows.is_empty() {
        print_table(
            &["CATEGORY", "KEY", "ACTION", "POLICY", "UNLINK", "BUNDLE", "APPLIED"],
            &rows,
        );
    }
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    for line in format_table(headers, rows) {
        println!("  {}", line);
    }
}

/// Left-aligned columns separated by two spaces; trailing blanks trimmed.
fn format_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    std::iter::once(render_row(headers, &widths))
        .chain(rows.iter().map(|row| {
            let cells: Vec<&str> = row.iter().map(String::as_str).collect();
            render_row(&cells, &widths)
        }))
        .collect()
}

fn render_row(cells: &[&str], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}
