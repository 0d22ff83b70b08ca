mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(about = "Run untrusted code in a disposable, time-limited sandbox")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Execution timeout in milliseconds (overrides the config file)
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Interpreter command, e.g. "python3 -c" (overrides the config file)
    #[arg(long, global = true)]
    pub interpreter: Option<String>,

    /// Run the channel endpoint in this process instead of spawning a worker
    #[arg(long, global = true)]
    pub in_process: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one program and report its outcome
    Run {
        /// File containing the code ("-" or omitted reads stdin)
        file: Option<PathBuf>,

        /// Code given inline instead of a file
        #[arg(short = 'e', long = "eval", conflicts_with = "file")]
        code: Option<String>,

        /// Print the outcome as JSON instead of plain output
        #[arg(long)]
        json: bool,
    },
    /// Interactive session; a blank line submits the current block
    Repl,
    /// Serve the execution channel on stdin/stdout
    Worker {
        /// PATH handed to the interpreter
        #[arg(long, default_value = sandpit_sandbox::worker::DEFAULT_PATH_ENV)]
        path: String,

        #[command(flatten)]
        limits: sandpit_sandbox::ResourceLimits,

        /// Interpreter command, given after `--`
        #[arg(last = true)]
        interpreter: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Run { file, code, json } => {
            let source = match (code, file) {
                (Some(code), _) => commands::CodeSource::Inline(code),
                (None, Some(path)) if path != Path::new("-") => commands::CodeSource::File(path),
                (None, _) => commands::CodeSource::Stdin,
            };
            let config =
                commands::load_config(cli.config.as_deref(), cli.timeout_ms, cli.interpreter);
            let result = match config {
                Ok(config) => commands::execute_run(config, cli.in_process, source, json).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(code) => Ok(ExitCode::from(code)),
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    Ok(ExitCode::from(commands::EXIT_OTHER))
                }
            }
        }
        Commands::Repl => {
            let config =
                commands::load_config(cli.config.as_deref(), cli.timeout_ms, cli.interpreter)?;
            commands::execute_repl(config, cli.in_process).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker {
            path,
            limits,
            interpreter,
        } => {
            commands::serve_worker(path, limits, interpreter).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Install the stderr subscriber plus an optional non-blocking file layer
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "info" };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "sandpit={},sandpit_cli={},sandpit_sandbox={}",
                    log_level, log_level, log_level
                ))
            }),
        )
        .init();

    Ok(guard)
}
