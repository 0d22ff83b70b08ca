//! CLI command implementations
//!
//! Each subcommand builds its own controller; nothing is shared between
//! invocations.

use anyhow::{Context, Result};
use sandpit_sandbox::worker::{self, WorkerOptions};
use sandpit_sandbox::{
    ExecutionOutcome, LocalRuntime, NullObserver, ProcessRuntime, ResourceLimits, Runtime,
    SandboxConfig, SandboxController, SandboxObserver, WorkerConfig,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info};

pub const EXIT_COMPLETED: u8 = 0;
pub const EXIT_RUNTIME_ERROR: u8 = 1;
pub const EXIT_TIMED_OUT: u8 = 2;
pub const EXIT_OTHER: u8 = 3;

/// Where `run` takes its program from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    Inline(String),
    File(PathBuf),
    Stdin,
}

impl CodeSource {
    async fn read(self) -> Result<String> {
        match self {
            CodeSource::Inline(code) => Ok(code),
            CodeSource::File(path) => tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display())),
            CodeSource::Stdin => {
                let mut code = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut code)
                    .await
                    .context("Failed to read code from stdin")?;
                Ok(code)
            }
        }
    }
}

/// Load the config file (if any) and apply command line overrides
pub fn load_config(
    path: Option<&Path>,
    timeout_ms: Option<u64>,
    interpreter: Option<String>,
) -> Result<SandboxConfig> {
    let mut config = match path {
        Some(path) => SandboxConfig::from_file(path)?,
        None => SandboxConfig::default(),
    };
    if let Some(millis) = timeout_ms {
        config = config.with_timeout_ms(millis);
    }
    if let Some(interpreter) = interpreter {
        config = config.with_interpreter(interpreter.split_whitespace());
    }
    config.validate()?;
    debug!(?config, "Configuration loaded");
    Ok(config)
}

/// Pick the runtime that creates isolated contexts.
///
/// Without a configured worker program the CLI re-invokes itself with the
/// `worker` subcommand.
pub fn build_runtime(config: &SandboxConfig, in_process: bool) -> Result<Arc<dyn Runtime>> {
    if in_process {
        return Ok(Arc::new(LocalRuntime::from_config(&config.worker)));
    }
    if config.worker.program.is_some() {
        return Ok(Arc::new(ProcessRuntime::from_config(&config.worker)));
    }

    let program = std::env::current_exe().context("Failed to locate the sandpit executable")?;
    let mut args = vec!["worker".to_string()];
    args.extend(config.worker.args.iter().cloned());
    let worker = WorkerConfig {
        program: Some(program),
        args,
        interpreter: config.worker.interpreter.clone(),
        limits: config.worker.limits.clone(),
    };
    Ok(Arc::new(ProcessRuntime::from_config(&worker)))
}

pub fn exit_code(outcome: &ExecutionOutcome) -> u8 {
    match outcome {
        ExecutionOutcome::Completed { .. } => EXIT_COMPLETED,
        ExecutionOutcome::RuntimeError { .. } => EXIT_RUNTIME_ERROR,
        ExecutionOutcome::TimedOut { .. } => EXIT_TIMED_OUT,
        ExecutionOutcome::Cancelled | ExecutionOutcome::ContextLost { .. } => EXIT_OTHER,
    }
}

/// Execute one program and return the process exit code
pub async fn execute_run(
    config: SandboxConfig,
    in_process: bool,
    source: CodeSource,
    json: bool,
) -> Result<u8> {
    let code = source.read().await?;
    let runtime = build_runtime(&config, in_process)?;
    let controller = SandboxController::from_parts(runtime, config, Arc::new(NullObserver));

    info!(code_len = code.len(), "Running program");
    let result = controller.execute(code).await;
    controller.teardown().await;
    let outcome = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(exit_code(&outcome))
}

/// Reports context loading on stderr
struct ReplObserver;

impl SandboxObserver for ReplObserver {
    fn on_load_start(&self) {
        eprintln!("[loading context...]");
    }

    fn on_load_end(&self) {
        eprintln!("[context ready]");
    }

    fn on_load_failed(&self, message: &str) {
        eprintln!("[context failed to load: {}]", message);
    }
}

/// Interactive loop; every blank-line-terminated block is one execution
pub async fn execute_repl(config: SandboxConfig, in_process: bool) -> Result<()> {
    let runtime = build_runtime(&config, in_process)?;
    let controller = SandboxController::from_parts(runtime, config, Arc::new(ReplObserver));
    eprintln!("sandpit repl: submit a block with an empty line, Ctrl-D to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut block = String::new();
    loop {
        let line = lines.next_line().await.context("Failed to read stdin")?;
        let submit = match &line {
            Some(line) if !line.trim().is_empty() => {
                block.push_str(line);
                block.push('\n');
                false
            }
            _ => true,
        };

        if submit && !block.trim().is_empty() {
            match controller.execute(std::mem::take(&mut block)).await {
                Ok(outcome) => print_outcome(&outcome),
                Err(e) => eprintln!("✗ {}", e),
            }
        }
        if line.is_none() {
            break;
        }
    }

    controller.teardown().await;
    Ok(())
}

/// Serve the execution channel on this process's stdin/stdout
pub async fn serve_worker(
    path: String,
    limits: ResourceLimits,
    interpreter: Vec<String>,
) -> Result<()> {
    let mut options = WorkerOptions::default();
    if !interpreter.is_empty() {
        options.interpreter = interpreter;
    }
    options.path_env = path;
    options.limits = limits;
    worker::serve(tokio::io::stdin(), tokio::io::stdout(), options).await
}

fn print_outcome(outcome: &ExecutionOutcome) {
    if let Some(output) = outcome.output() {
        print!("{}", output);
        if !output.is_empty() && !output.ends_with('\n') {
            println!();
        }
        let _ = std::io::stdout().flush();
    }
    match outcome {
        ExecutionOutcome::Completed { .. } => {}
        ExecutionOutcome::RuntimeError { message, .. } => eprintln!("✗ Runtime error: {}", message),
        ExecutionOutcome::TimedOut { .. } => eprintln!("✗ Timed out"),
        ExecutionOutcome::Cancelled => eprintln!("✗ Cancelled"),
        ExecutionOutcome::ContextLost { message } => eprintln!("✗ Context lost: {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes() {
        let completed = ExecutionOutcome::Completed {
            output: String::new(),
        };
        let failed = ExecutionOutcome::RuntimeError {
            message: "boom".into(),
            output: String::new(),
        };
        let timed_out = ExecutionOutcome::TimedOut {
            output: String::new(),
        };
        assert_eq!(exit_code(&completed), 0);
        assert_eq!(exit_code(&failed), 1);
        assert_eq!(exit_code(&timed_out), 2);
        assert_eq!(exit_code(&ExecutionOutcome::Cancelled), 3);
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "timeout = \"5s\"\nmax_output_bytes = 1024\n\n[worker]\ninterpreter = [\"bash\", \"-c\"]"
        )
        .unwrap();

        let config = load_config(Some(file.path()), None, None).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_output_bytes, 1024);
        assert_eq!(config.worker.interpreter, vec!["bash", "-c"]);

        let config =
            load_config(Some(file.path()), Some(250), Some("python3 -c".into())).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.worker.interpreter, vec!["python3", "-c"]);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        assert!(load_config(None, Some(0), None).is_err());
        assert!(load_config(None, None, Some("   ".into())).is_err());
        assert!(load_config(Some(Path::new("/nonexistent/sandpit.toml")), None, None).is_err());
    }

    #[test]
    fn test_build_runtime_selection() {
        let config = SandboxConfig::default();
        assert_eq!(build_runtime(&config, true).unwrap().name(), "local");
        assert_eq!(build_runtime(&config, false).unwrap().name(), "process");
    }

    #[tokio::test]
    async fn test_code_source_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "echo hi").unwrap();
        let code = CodeSource::File(file.path().to_path_buf())
            .read()
            .await
            .unwrap();
        assert_eq!(code, "echo hi");
        assert_eq!(
            CodeSource::Inline("1+1".into()).read().await.unwrap(),
            "1+1"
        );
    }

    #[tokio::test]
    async fn test_run_in_process_exit_codes() {
        let config = SandboxConfig::default();
        let code = execute_run(
            config.clone(),
            true,
            CodeSource::Inline("echo ok".into()),
            false,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_COMPLETED);

        let code = execute_run(
            config.clone(),
            true,
            CodeSource::Inline("exit 4".into()),
            false,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_RUNTIME_ERROR);

        let code = execute_run(
            config.with_timeout_ms(300),
            true,
            CodeSource::Inline("sleep 5".into()),
            true,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_TIMED_OUT);
    }
}
