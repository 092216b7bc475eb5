use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use regress_runner::{
    compare, resolve, Config, CorpusReport, CorpusRunner, DependencyMode, Engine, FixtureLoader,
    LogFormat, PostgresEngine, Registry, RunOptions, ScriptedEngine, SuiteName, SuiteRunner,
};

#[derive(Parser)]
#[command(name = "regress-runner")]
#[command(about = "Runs SQL regression fixtures against a PostgreSQL-compatible engine")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Path to configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory containing fixture JSON files")]
    fixtures: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory containing data files for {{data:NAME}}")]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Engine connection url")]
    url: Option<String>,

    #[arg(long, global = true, help = "Per-statement timeout in milliseconds")]
    timeout_ms: Option<u64>,

    #[arg(long, global = true, help = "Maximum number of roots running at once")]
    concurrency: Option<usize>,

    #[arg(long, global = true, help = "Run suites that are marked disabled")]
    include_disabled: bool,

    #[arg(long, global = true, help = "Fail a root when one of its dependencies fails")]
    strict_deps: bool,

    #[arg(long, global = true, help = "Use an in-memory engine on which every statement succeeds with no rows")]
    dry_run: bool,

    #[arg(long, global = true, help = "Write the run report to this JSON file")]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// List registered suites
    List,
    /// Print the execution order of a suite
    Resolve { suite: String },
    /// Run one or more suites
    Run {
        #[arg(required = true)]
        suites: Vec<String>,
    },
    /// Run every registered suite
    RunAll {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Compare two saved reports
    Compare { from: PathBuf, to: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    apply_args(&mut config, &args);
    config.validate()?;

    init_tracing(&config);

    match &args.command {
        Command::Compare { from, to } => {
            let from = CorpusReport::load(from)?;
            let to = CorpusReport::load(to)?;
            let comparison = compare(&from, &to);
            println!("{}", comparison.to_markdown());
            return Ok(exit_code(!comparison.has_regressions()));
        }
        Command::List => {
            let registry = load_registry(&config)?;
            for file in registry.names().iter().filter_map(|n| registry.lookup(n)) {
                let deps: Vec<&str> = file.depends_on.iter().map(|d| d.as_str()).collect();
                println!(
                    "{}{}\t{} statements\tdepends on: [{}]\ttags: [{}]",
                    file.name,
                    if file.enabled { "" } else { " (disabled)" },
                    file.statements.len(),
                    deps.join(", "),
                    file.tags.join(", ")
                );
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Resolve { suite } => {
            let registry = load_registry(&config)?;
            let root = SuiteName::new(suite.as_str())?;
            for name in resolve(&registry, &root)? {
                println!("{}", name);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run { .. } | Command::RunAll { .. } => {}
    }

    let registry = Arc::new(load_registry(&config)?);
    let roots = match &args.command {
        Command::Run { suites } => suites
            .iter()
            .map(|s| SuiteName::new(s.as_str()))
            .collect::<regress_runner::Result<Vec<_>>>()?,
        Command::RunAll { tag } => CorpusRunner::select_roots(&registry, tag.as_deref()),
        _ => Vec::new(),
    };

    let engine: Arc<dyn Engine> = if args.dry_run {
        info!("Dry run, statements are not sent to an engine");
        Arc::new(ScriptedEngine::new())
    } else {
        Arc::new(PostgresEngine::from_config(&config.engine)?)
    };
    info!(mode = ?engine.mode(), roots = roots.len(), "Engine ready");

    let options = RunOptions::from_config(&config)?;
    let runner = SuiteRunner::new(Arc::clone(&registry), engine).with_options(options);
    let corpus = CorpusRunner::with_max_concurrency(runner, config.runner.max_concurrency);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let report = corpus.run(&roots, &cancel).await;

    for run in &report.runs {
        println!("{}", run.summary());
    }
    let totals = report.totals();
    println!(
        "\n{} roots: {} statements passed, {} skipped, {} failed ({} ms)",
        report.runs.len(),
        totals.passed,
        totals.skipped,
        totals.failed,
        report.elapsed_ms
    );

    if let Some(output) = &args.output {
        report
            .save(output)
            .with_context(|| format!("Failed to write report to {}", output.display()))?;
        info!(path = %output.display(), "Report written");
    }

    Ok(exit_code(report.passed()))
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(dir) = &args.fixtures {
        config.fixtures.dir = dir.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.fixtures.data_dir = Some(dir.clone());
    }
    if let Some(url) = &args.url {
        config.engine.url = Some(url.clone());
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.runner.statement_timeout_ms = timeout_ms;
    }
    if let Some(concurrency) = args.concurrency {
        config.runner.max_concurrency = concurrency;
    }
    if args.include_disabled {
        config.runner.include_disabled = true;
    }
    if args.strict_deps {
        config.runner.dependency_mode = DependencyMode::Strict;
    }
}

fn load_registry(config: &Config) -> anyhow::Result<Registry> {
    FixtureLoader::load_dir(&config.fixtures.dir)
        .with_context(|| format!("Failed to load fixtures from {}", config.fixtures.dir.display()))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling run");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling run");
        }
    }
}
