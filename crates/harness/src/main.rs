//! pagination-harness
//!
//! Runs a test command against one shared browser and fixture server.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use pagination_harness::report::{load_results, Summary};
use pagination_harness::{
    global_teardown, init_tracing, BaselineMode, GlobalSetup, HarnessConfig, PopplerRasterizer,
    Rasterizer,
};

#[derive(Parser)]
#[command(name = "pagination-harness")]
#[command(about = "Shared-browser runner for pagination visual tests")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pagination-harness.toml", global = true)]
    config: PathBuf,

    /// Keep scratch files and leave the browser running
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the shared browser, run a test command against it, tear down
    Run(RunArgs),

    /// Remove the working directory and endpoint record
    Teardown,

    /// Rasterize one page of a PDF for manual inspection
    Rasterize(RasterizeArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Directory served at the fixture origin
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Fixture server port (0 = auto)
    #[arg(long)]
    port: Option<u16>,

    /// Directory for per-file JSON results
    #[arg(long)]
    results: Option<PathBuf>,

    /// Baseline handling: create, require or update
    #[arg(long)]
    baselines: Option<BaselineMode>,

    /// Test command, e.g. `-- cargo test -p pagination-harness`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct RasterizeArgs {
    /// PDF to rasterize
    pdf: PathBuf,

    /// 1-based page number
    #[arg(short, long, default_value = "1")]
    page: u32,

    /// Output prefix (`.png` is appended)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match HarnessConfig::load(&cli.config).and_then(HarnessConfig::apply_env) {
        Ok(mut config) => {
            config.debug |= cli.debug;
            config
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing(config.debug);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ExitCode::from(2);
        }
    };

    match rt.block_on(dispatch(cli.command, config)) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Commands, config: HarnessConfig) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Run(args) => run(args, config).await,
        Commands::Teardown => {
            global_teardown(&config, None).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rasterize(args) => rasterize(args, config).await,
    }
}

async fn run(args: RunArgs, mut config: HarnessConfig) -> anyhow::Result<ExitCode> {
    if let Some(root) = args.fixtures {
        config.fixtures.root = root;
    }
    if let Some(port) = args.port {
        config.fixtures.port = port;
    }
    if let Some(dir) = args.results {
        config.results_dir = Some(dir);
    }
    if let Some(mode) = args.baselines {
        config.snapshot.baseline_mode = mode;
    }
    // Test processes may run from another directory
    let cwd = std::env::current_dir()?;
    config.results_dir = config.results_dir.map(|dir| cwd.join(dir));
    config.work_dir = cwd.join(&config.work_dir);

    let (program, rest) = args
        .command
        .split_first()
        .context("no test command given")?;

    let session = match GlobalSetup::run(&config).await {
        Ok(session) => session,
        Err(e) => {
            error!("Global setup failed: {}", e);
            return Ok(ExitCode::from(2));
        }
    };

    if let Some(dir) = &config.results_dir {
        if let Err(e) = clear_results(dir) {
            warn!("{:#}", e);
        }
    }

    info!("Running: {}", args.command.join(" "));

    let spawned = tokio::process::Command::new(program)
        .args(rest)
        .envs(session.child_env().iter().map(|(k, v)| (k, v)))
        .spawn();

    let status = match spawned {
        Ok(mut child) => {
            tokio::select! {
                status = child.wait() => status.map(Some),
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping test command");
                    let _ = child.kill().await;
                    Ok(None)
                }
            }
        }
        Err(e) => Err(e),
    };

    let summary = match &config.results_dir {
        Some(dir) => match load_results(dir) {
            Ok(results) => Some(Summary::from_results(&results)),
            Err(e) => {
                warn!("Failed to read results from {}: {}", dir.display(), e);
                None
            }
        },
        None => None,
    };
    if let Some(summary) = &summary {
        info!(
            "Test Results: {} file(s), {} passed, {} failed, {} setup failure(s) ({} ms)",
            summary.files,
            summary.passed,
            summary.failed,
            summary.setup_failures,
            summary.duration_ms
        );
        if summary.fatal_setup_failures > 0 {
            error!(
                "{} file(s) found no endpoint record at {}",
                summary.fatal_setup_failures,
                config.endpoint_file().display()
            );
        }
    }

    if config.debug {
        info!("Debug mode: fixtures at {}", session.origin());
        info!("Debug mode: browser at {}", session.endpoint());
        info!("Press Ctrl-C to exit");
        let _ = tokio::signal::ctrl_c().await;
    }

    global_teardown(&config, Some(session)).await?;

    let status = status.with_context(|| format!("failed to run {}", program))?;
    if summary.is_some_and(|s| s.fatal_setup_failures > 0) {
        return Ok(ExitCode::from(2));
    }
    let code = match status {
        Some(status) if status.success() => ExitCode::SUCCESS,
        Some(status) => {
            warn!("Test command exited with {}", status);
            ExitCode::from(status.code().map(|c| c.clamp(1, 255) as u8).unwrap_or(1))
        }
        None => ExitCode::from(130),
    };
    Ok(code)
}

/// Reports from an earlier run would be counted again
fn clear_results(dir: &std::path::Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to clear {}", dir.display())),
    }
}

async fn rasterize(args: RasterizeArgs, config: HarnessConfig) -> anyhow::Result<ExitCode> {
    let rasterizer = PopplerRasterizer::new(&config.snapshot);

    let pages = rasterizer.page_count(&args.pdf).await?;
    let out_prefix = args.out.unwrap_or_else(|| {
        let stem = args
            .pdf
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "page".to_string());
        args.pdf.with_file_name(format!("{}-page-{}", stem, args.page))
    });

    let png = rasterizer
        .rasterize(&args.pdf, args.page, config.snapshot.dpi, &out_prefix)
        .await?;

    info!("{} has {} page(s)", args.pdf.display(), pages);
    println!("{}", png.display());
    Ok(ExitCode::SUCCESS)
}
