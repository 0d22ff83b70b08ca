//! Out-of-process runtime - each context is a worker child process

use super::{ContextConnection, Terminator};
use crate::config::WorkerConfig;
use crate::error::SandboxError;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Name of the worker binary looked up on PATH when none is configured
pub const DEFAULT_WORKER_PROGRAM: &str = "sandpit-worker";

/// Process-based runtime - spawns a worker that speaks the channel protocol
/// on its stdin/stdout
pub struct ProcessRuntime {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessRuntime {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Build from config; limits become worker flags and the interpreter is
    /// passed after `--`
    pub fn from_config(config: &WorkerConfig) -> Self {
        let program = config
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_PROGRAM));
        let mut args = config.args.clone();
        args.extend(config.limits.to_args());
        args.push("--".to_string());
        args.extend(config.interpreter.iter().cloned());
        Self { program, args }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl super::Runtime for ProcessRuntime {
    async fn connect(&self) -> Result<ContextConnection> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The worker leads its own group so teardown reaches every descendant
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            SandboxError::LoadFailure(format!(
                "Failed to spawn worker {}: {}",
                self.program.display(),
                e
            ))
        })?;
        let pid = child.id();
        tracing::debug!(pid = ?pid, program = %self.program.display(), "Spawned worker");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::LoadFailure("Worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::LoadFailure("Worker stdout unavailable".into()))?;

        // Relay worker diagnostics into our own log
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "sandpit::worker", pid = ?pid, "{}", line);
                }
            });
        }

        Ok(ContextConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            terminator: Box::new(ProcessTerminator { child, pid }),
        })
    }

    fn name(&self) -> &str {
        "process"
    }
}

struct ProcessTerminator {
    child: Child,
    pid: Option<u32>,
}

impl ProcessTerminator {
    fn kill_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

#[async_trait]
impl Terminator for ProcessTerminator {
    async fn terminate(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, pid = ?self.pid, "Worker already gone");
        }
        self.pid = None;
    }
}

impl Drop for ProcessTerminator {
    fn drop(&mut self) {
        self.kill_group();
    }
}
