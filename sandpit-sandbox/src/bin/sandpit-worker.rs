//! Isolated context worker
//!
//! Speaks the execution channel protocol on stdin/stdout. Diagnostics go to
//! stderr, which the host relays into its own log.

use anyhow::Result;
use clap::Parser;
use sandpit_sandbox::worker::{self, WorkerOptions, DEFAULT_PATH_ENV};
use sandpit_sandbox::ResourceLimits;

#[derive(Parser)]
#[command(name = "sandpit-worker")]
#[command(about = "Sandpit isolated context worker")]
struct Args {
    /// PATH handed to the interpreter
    #[arg(long, default_value = DEFAULT_PATH_ENV)]
    path: String,

    #[command(flatten)]
    limits: ResourceLimits,

    /// Interpreter command, given after `--`; code is appended as the last argument
    #[arg(last = true)]
    interpreter: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sandpit_sandbox=info")),
        )
        .init();

    let args = Args::parse();
    let mut options = WorkerOptions::default();
    if !args.interpreter.is_empty() {
        options.interpreter = args.interpreter;
    }
    options.path_env = args.path;
    options.limits = args.limits;

    worker::serve(tokio::io::stdin(), tokio::io::stdout(), options).await
}
