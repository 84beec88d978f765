//! Warden command line
//!
//! Replays a recorded runner event stream through the lifecycle
//! controller, writing a JSON-lines report and failure artifacts.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use warden_harness::{HarnessConfig, JsonlReportSink, LifecycleController, Replay};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Retry-aware lifecycle controller for browser test suites")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON-lines runner event stream
    Replay {
        /// Event file, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        events: PathBuf,

        /// Override the retry ceiling
        #[arg(long)]
        ceiling: Option<u32>,

        /// Override the artifact root directory
        #[arg(long)]
        artifact_root: Option<PathBuf>,

        /// Output directory for the report
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Suite name
        #[arg(long)]
        suite: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(2);
        }
    };

    match rt.block_on(async_main(cli)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<bool> {
    let mut config = HarnessConfig::load(&cli.config)?;
    config.apply_env()?;

    match cli.command {
        Command::Replay {
            events,
            ceiling,
            artifact_root,
            output,
            suite,
        } => {
            if let Some(ceiling) = ceiling {
                config.retry.ceiling = ceiling;
            }
            if let Some(root) = artifact_root {
                config.artifacts.root = root;
            }
            if let Some(output) = output {
                config.report.output_dir = output;
            }
            if let Some(suite) = suite {
                config.suite_name = suite;
            }

            let sink = Arc::new(JsonlReportSink::new(config.report.output_dir.clone()));
            let controller = Arc::new(LifecycleController::new(config, sink.clone())?);
            let replay = Replay::new(controller);

            let summary = if events.as_os_str() == "-" {
                replay.run(BufReader::new(tokio::io::stdin())).await?
            } else {
                let file = tokio::fs::File::open(&events).await?;
                replay.run(BufReader::new(file)).await?
            };

            if let Some(path) = sink.path() {
                println!("Report: {}", path.display());
            }
            println!(
                "{} total, {} passed, {} failed, {} skipped",
                summary.total, summary.passed, summary.failed, summary.skipped
            );
            Ok(summary.success())
        }
    }
}
