use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use modelflow_core::{Config, RunReport, RunResult, RunStatus, TestResult, TestStatus, UnitStatus};
use modelflow_project::{NodeId, Selector};
use modelflow_runtime::{
    Executor, ExecutorOptions, JsonLinesRunStore, Pipeline, RunStore, Scheduler, TestEngine, Trigger,
};
use modelflow_warehouse::{DuckDbWarehouse, PostgresOptions, PostgresWarehouse, Warehouse, WarehousePool};

/// Modelflow - build and test a DAG of SQL units
#[derive(Parser)]
#[command(name = "modelflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: modelflow.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List units in build order
    Ls {
        /// Selectors (`name`, `+name`, `name+`, `kind:staging`)
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,
    },

    /// Compile units and write their SQL
    Compile {
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        /// Output directory for compiled SQL
        #[arg(short, long, default_value = "target/compiled")]
        output: PathBuf,
    },

    /// Build units and run their tests
    Run {
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        /// Fail the run when an error-severity test fails
        #[arg(long)]
        strict: bool,

        /// Maximum concurrent warehouse connections
        #[arg(short, long)]
        threads: Option<usize>,

        /// Output file for the run report
        #[arg(short, long, default_value = "target/run_report.json")]
        output: PathBuf,
    },

    /// Run tests against relations that already exist
    Test {
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Show every unit downstream of a unit
    Downstream {
        /// Unit name
        unit: String,
    },

    /// Run cycles on an interval until interrupted
    Schedule {
        /// Seconds between cycles (default: [schedule] interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,

        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        #[arg(long)]
        strict: bool,
    },

    /// Show stored runs
    History {
        /// Number of most recent runs to show
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    // Load config if specified
    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else if Path::new("modelflow.toml").exists() {
        Config::from_file(Path::new("modelflow.toml"))?
    } else {
        if cli.verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };

    if cli.verbose {
        eprintln!("{} {}", "Project root:".cyan(), config.project_root.display());
    }

    match cli.command {
        Commands::Ls { select } => ls_command(&config, &select),
        Commands::Compile { select, output } => compile_command(&config, &select, &output),
        Commands::Run {
            select,
            strict,
            threads,
            output,
        } => run_command(&config, &select, strict, threads, &output).await,
        Commands::Test { select, threads } => test_command(&config, &select, threads).await,
        Commands::Downstream { unit } => downstream_command(&config, &unit),
        Commands::Schedule {
            interval,
            select,
            strict,
        } => schedule_command(&config, interval, &select, strict).await,
        Commands::History { limit } => history_command(&config, limit).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Load the project and apply selectors
fn load_project(config: &Config, select: &[String]) -> Result<(Pipeline, Vec<NodeId>)> {
    let pipeline = Pipeline::from_config(config).context("Failed to load project")?;

    let selectors = select
        .iter()
        .map(|s| s.parse::<Selector>())
        .collect::<Result<Vec<_>, _>>()?;
    let selected = pipeline.select(&selectors)?;

    Ok((pipeline, selected))
}

/// Open the configured warehouse and check the connection
async fn connect(config: &Config, threads: usize) -> Result<Arc<dyn Warehouse>> {
    let warehouse_config = config.warehouse.clone().unwrap_or_default();
    let settings = &warehouse_config.settings;

    let warehouse: Arc<dyn Warehouse> = match warehouse_config.warehouse_type.to_lowercase().as_str() {
        "duckdb" => match settings.get("path").map(String::as_str) {
            Some(":memory:") => Arc::new(DuckDbWarehouse::open_in_memory()?),
            Some(path) => Arc::new(DuckDbWarehouse::open(config.project_root.join(path))?),
            None => Arc::new(DuckDbWarehouse::open(config.project_root.join("target/warehouse.duckdb"))?),
        },
        "postgres" | "postgresql" => {
            let host = settings.get("host").map(String::as_str).unwrap_or("localhost");
            let database = settings
                .get("database")
                .ok_or_else(|| anyhow::anyhow!("PostgreSQL requires 'database' in warehouse settings"))?;
            let user = settings
                .get("user")
                .ok_or_else(|| anyhow::anyhow!("PostgreSQL requires 'user' in warehouse settings"))?;

            let mut options = PostgresOptions::new(host, database, user).connections(threads);
            if let Some(port) = settings.get("port") {
                options = options.port(port.parse().context("Invalid PostgreSQL port")?);
            }
            if let Some(password) = settings.get("password") {
                options = options.password(password);
            } else if let Some(variable) = settings.get("password_env") {
                let password = std::env::var(variable)
                    .with_context(|| format!("Environment variable {} is not set", variable))?;
                options = options.password(password);
            }
            if let Some(tls) = settings.get("tls") {
                options = options.tls(tls == "true");
            }

            Arc::new(PostgresWarehouse::connect(&options).await?)
        }
        other => {
            return Err(anyhow::anyhow!(
                "Unsupported warehouse type '{}'. Supported: duckdb, postgres",
                other
            ));
        }
    };

    warehouse
        .test_connection()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to warehouse: {}", e))?;
    tracing::debug!(warehouse = warehouse.name(), threads, "Warehouse connection verified");

    Ok(warehouse)
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, finishing running units...".yellow());
            token.cancel();
        }
    });
}

/// Ls command - units in build order
fn ls_command(config: &Config, select: &[String]) -> Result<()> {
    let (pipeline, selected) = load_project(config, select)?;
    let graph = pipeline.graph();

    for name in &selected {
        let Some(node) = graph.node(name) else {
            continue;
        };
        println!(
            "{:<40} {:<13} {:<6} {}",
            name.bold(),
            node.kind.to_string(),
            node.materialization.to_string(),
            pipeline.compiler().relation_for(name, node).dimmed()
        );
    }

    println!();
    println!("{} units", selected.len());
    Ok(())
}

/// Compile command - write compiled SQL to the output directory
fn compile_command(config: &Config, select: &[String], output: &Path) -> Result<()> {
    let (pipeline, selected) = load_project(config, select)?;
    let plan = pipeline.plan(&selected);
    let output = config.project_root.join(output);

    std::fs::create_dir_all(output.join("tests"))
        .with_context(|| format!("Failed to create {}", output.display()))?;

    for unit in &plan.units {
        std::fs::write(output.join(format!("{}.sql", unit.name)), format!("{}\n", unit.sql))?;
        for test in &unit.tests {
            std::fs::write(
                output.join("tests").join(format!("{}.sql", test.name)),
                format!("{}\n", test.failing_rows_sql),
            )?;
        }
        println!("  {} {}", "✓".green(), unit.name);
    }

    for failure in &plan.failures {
        println!(
            "  {} {}: {}",
            "✗".red(),
            failure.unit,
            failure.message.as_deref().unwrap_or_default()
        );
    }

    println!();
    println!(
        "Compiled {} of {} units into {}",
        plan.units.len(),
        plan.len(),
        output.display()
    );

    if !plan.failures.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

/// Run command - one cycle with retries
async fn run_command(
    config: &Config,
    select: &[String],
    strict: bool,
    threads: Option<usize>,
    output: &Path,
) -> Result<()> {
    let (pipeline, selected) = load_project(config, select)?;
    let threads = threads.unwrap_or(config.execution.threads);
    let warehouse = connect(config, threads).await?;

    let executor = Executor::new(
        WarehousePool::new(warehouse, threads),
        ExecutorOptions::from_config(&config.execution),
    );
    cancel_on_interrupt(executor.cancellation().clone());

    let mut scheduler = Scheduler::new(
        Arc::new(pipeline),
        executor,
        Arc::new(JsonLinesRunStore::new(config.run_log_path())),
    )
    .with_retry(config.retry.clone())
    .strict(strict || config.execution.strict);
    if !select.is_empty() {
        scheduler = scheduler.with_selection(selected);
    }

    let report = scheduler.run_cycle().await?;

    let output = config.project_root.join(output);
    report.save_to_file(&output)?;
    print_run_summary(&report);
    eprintln!("{} {}", "Run report saved to:".green(), output.display());

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Test command - evaluate tests without building
async fn test_command(config: &Config, select: &[String], threads: Option<usize>) -> Result<()> {
    let (pipeline, selected) = load_project(config, select)?;
    let plan = pipeline.plan(&selected);
    let threads = threads.unwrap_or(config.execution.threads);
    let warehouse = connect(config, threads).await?;

    let engine = TestEngine::new(
        WarehousePool::new(warehouse, threads),
        config.execution.statement_timeout(),
    );

    let mut results: Vec<TestResult> = Vec::new();
    for unit in &plan.units {
        results.extend(engine.evaluate(unit).await);
    }

    for result in &results {
        println!("  {} {}", test_marker(result.status), describe_test(result));
    }
    for failure in &plan.failures {
        println!(
            "  {} {}: {}",
            "✗".red(),
            failure.unit,
            failure.message.as_deref().unwrap_or_default()
        );
    }

    let blocking = results.iter().filter(|r| r.is_blocking()).count();
    let passed = results.iter().filter(|r| r.passed()).count();
    println!();
    println!("{} tests, {} passed, {} failing", results.len(), passed, blocking);

    if blocking > 0 || !plan.failures.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

/// Downstream command - what a change to `unit` rebuilds
fn downstream_command(config: &Config, unit: &str) -> Result<()> {
    let pipeline = Pipeline::from_config(config).context("Failed to load project")?;
    let graph = pipeline.graph();

    if !graph.contains(unit) {
        return Err(anyhow::anyhow!("Unit '{}' not found in project", unit));
    }

    let downstream = graph.downstream(unit);

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{} {}", "Downstream of".bold().bright_blue(), unit.bold());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    if downstream.is_empty() {
        println!("{}", "✓ No downstream units".green());
    } else {
        for (i, name) in downstream.iter().enumerate() {
            let direct = graph.children(unit).iter().any(|child| *child == name);
            let marker = if direct { "direct" } else { "transitive" };
            println!("  {}. {} ({})", i + 1, name.yellow(), marker);
        }
        println!();
        println!("{} downstream units", downstream.len());
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
    Ok(())
}

/// Schedule command - interval cycles until Ctrl-C
async fn schedule_command(config: &Config, interval: Option<u64>, select: &[String], strict: bool) -> Result<()> {
    let interval = interval
        .or_else(|| config.schedule.as_ref().map(|s| s.interval_secs))
        .ok_or_else(|| anyhow::anyhow!("No interval given. Pass --interval or add [schedule] interval_secs"))?;

    let (pipeline, selected) = load_project(config, select)?;
    let threads = config.execution.threads;
    let warehouse = connect(config, threads).await?;

    let executor = Executor::new(
        WarehousePool::new(warehouse, threads),
        ExecutorOptions::from_config(&config.execution),
    );
    cancel_on_interrupt(executor.cancellation().clone());

    let mut scheduler = Scheduler::new(
        Arc::new(pipeline),
        executor,
        Arc::new(JsonLinesRunStore::new(config.run_log_path())),
    )
    .with_retry(config.retry.clone())
    .strict(strict || config.execution.strict);
    if !select.is_empty() {
        scheduler = scheduler.with_selection(selected);
    }

    eprintln!("{} every {}s (Ctrl-C to stop)", "Scheduling runs".cyan(), interval);
    let cycles = scheduler.schedule(Trigger::Interval(Duration::from_secs(interval))).await;
    println!("Ran {} cycles", cycles);
    Ok(())
}

/// History command - most recent stored runs
async fn history_command(config: &Config, limit: usize) -> Result<()> {
    let store = JsonLinesRunStore::new(config.run_log_path());
    let history = store.history(Some(limit)).await?;

    if history.is_empty() {
        println!("No runs recorded in {}", store.path().display());
        return Ok(());
    }

    for report in &history {
        println!(
            "{}  {}  {:<9}  {} ok, {} failed, {} skipped, {} attempt(s)",
            report.started_at,
            report.run_id.dimmed(),
            run_status(report.status),
            report.summary.succeeded,
            report.summary.failed,
            report.summary.skipped,
            report.attempts
        );
    }
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Modelflow Run Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Run: {}", report.run_id);
    println!("Started: {}", report.started_at);
    println!();

    for result in &report.results {
        println!("  {} {}", unit_marker(result), describe_unit(result));
        for test in &result.test_results {
            println!("      {} {}", test_marker(test.status), describe_test(test));
        }
    }

    let summary = &report.summary;
    println!();
    println!("{}", "Summary:".bold());
    println!("  Units:    {}", summary.units);
    println!("  Success:  {}", format!("{}", summary.succeeded).green());
    if summary.failed > 0 {
        println!("  Failed:   {}", format!("{}", summary.failed).red().bold());
    } else {
        println!("  Failed:   {}", format!("{}", summary.failed).green());
    }
    if summary.skipped > 0 {
        println!("  Skipped:  {}", format!("{}", summary.skipped).yellow());
    }
    println!(
        "  Tests:    {} passed, {} failed, {} warned, {} errored, {} skipped",
        summary.tests_passed, summary.tests_failed, summary.tests_warned, summary.tests_errored, summary.tests_skipped
    );
    println!("  Attempts: {}", report.attempts);
    println!();
    println!("Status: {}", run_status(report.status));
    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

fn unit_marker(result: &RunResult) -> colored::ColoredString {
    match result.status {
        UnitStatus::Success => "✓".green(),
        UnitStatus::Failed => "✗".red(),
        UnitStatus::Skipped => "-".yellow(),
    }
}

fn describe_unit(result: &RunResult) -> String {
    let mut line = format!("{} ({} ms)", result.unit, result.duration_ms);
    if let Some(rows) = result.rows_affected {
        line.push_str(&format!(", {} rows", rows));
    }
    if result.attempts > 1 {
        line.push_str(&format!(", {} attempts", result.attempts));
    }
    if let Some(message) = &result.message {
        line.push_str(&format!(": {}", message));
    }
    line
}

fn test_marker(status: TestStatus) -> colored::ColoredString {
    match status {
        TestStatus::Pass => "✓".green(),
        TestStatus::Fail | TestStatus::Error => "✗".red(),
        TestStatus::Warn => "⚠".yellow(),
        TestStatus::Skipped => "-".dimmed(),
    }
}

fn describe_test(result: &TestResult) -> String {
    match (&result.message, result.status) {
        (_, TestStatus::Pass) => result.test.clone(),
        (Some(message), _) => format!("{} [{}]: {}", result.test, result.status, message),
        (None, _) => format!("{} [{}]", result.test, result.status),
    }
}

fn run_status(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Success => "success".green().bold(),
        RunStatus::Failed => "failed".red().bold(),
        RunStatus::Cancelled => "cancelled".yellow().bold(),
    }
}
