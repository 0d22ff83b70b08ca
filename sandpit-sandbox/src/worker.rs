//! Isolated-context side of the execution channel
//!
//! A worker reads [`HostMessage`] frames, runs every submitted program in a
//! fresh interpreter process and streams [`WorkerMessage`] frames back. Each run
//! gets its own scratch directory and an empty environment, so nothing
//! survives from one run to the next.

use crate::config::WorkerConfig;
use crate::limits::{self, ResourceLimits, CONFINED_SCRATCH};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use sandpit_common::{
    decode_line, encode_line, ExecutionRequest, HostMessage, OutputFragment, OutputStream,
    WorkerMessage, MAX_FRAME_BYTES,
};
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// PATH handed to interpreters
pub const DEFAULT_PATH_ENV: &str = "/usr/local/bin:/usr/bin:/bin";

/// Largest piece of program output carried by one fragment
const MAX_CHUNK_BYTES: u64 = 16 * 1024;

/// Stderr lines kept for runtime error messages
const STDERR_TAIL_LINES: usize = 20;

const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// How a worker evaluates submitted code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Interpreter command; the code is appended as the final argument
    pub interpreter: Vec<String>,

    pub path_env: String,

    /// Put each interpreter in its own process group and kill the group when
    /// the run ends. Needed when the worker itself is not killed as a group.
    pub isolate_process_group: bool,

    pub limits: ResourceLimits,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interpreter: vec!["/bin/sh".to_string(), "-c".to_string()],
            path_env: DEFAULT_PATH_ENV.to_string(),
            isolate_process_group: false,
            limits: ResourceLimits::default(),
        }
    }
}

impl WorkerOptions {
    pub fn with_interpreter<I, S>(interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interpreter: interpreter.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            limits: config.limits.clone(),
            ..Self::default()
        }
    }

    /// Short name reported in the ready message
    pub fn runtime_name(&self) -> String {
        self.interpreter
            .first()
            .map(|program| {
                Path::new(program)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| program.clone())
            })
            .unwrap_or_default()
    }

    /// Interpreter command for one run. `confined` runs see `scratch` as
    /// their private `/tmp`.
    fn command(&self, code: &str, scratch: &Path, confined: bool) -> Option<Command> {
        let (program, args) = self.interpreter.split_first()?;
        let home = if confined {
            Path::new(CONFINED_SCRATCH)
        } else {
            scratch
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(code)
            .current_dir(scratch)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", home)
            .env("TMPDIR", home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        if self.isolate_process_group {
            command.process_group(0);
        }
        limits::confine(&mut command, &self.limits, scratch, confined);
        Some(command)
    }
}

type FrameSink<W> = FramedWrite<W, LinesCodec>;

/// Serve the execution channel until the host sends `Shutdown` or hangs up
pub async fn serve<R, W>(reader: R, writer: W, options: WorkerOptions) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut requests = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut sink = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    let confined = match check_interpreter(&options).await {
        Ok(confined) => confined,
        Err(message) => {
            tracing::error!(error = %message, "Interpreter unavailable");
            send(&mut sink, &WorkerMessage::LoadFailed { message }).await?;
            return Ok(());
        }
    };

    let runtime = options.runtime_name();
    tracing::info!(runtime = %runtime, confined, "Worker ready");
    send(&mut sink, &WorkerMessage::Ready { runtime }).await?;

    while let Some(frame) = requests.next().await {
        let line = frame.context("Failed to read request frame")?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<HostMessage>(&line) {
            Ok(HostMessage::Execute(request)) => {
                execute(&request, &options, confined, &mut sink).await?
            }
            Ok(HostMessage::Shutdown) => {
                tracing::debug!("Shutdown requested");
                break;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed request"),
        }
    }
    Ok(())
}

async fn send<W>(sink: &mut FrameSink<W>, message: &WorkerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(message)?;
    sink.send(line)
        .await
        .context("Failed to write to execution channel")
}

/// Check that the interpreter starts and accepts empty code. Returns whether
/// runs will be confined in namespaces.
async fn check_interpreter(options: &WorkerOptions) -> std::result::Result<bool, String> {
    let limits = &options.limits;
    if limits.namespaces && ResourceLimits::namespaces_supported() {
        match try_interpreter(options, true).await {
            Ok(()) => return Ok(true),
            Err(e) if limits.require_namespaces => {
                return Err(format!("Namespace confinement unavailable: {}", e));
            }
            Err(e) => tracing::warn!(
                error = %e,
                "Namespace confinement unavailable; runs share the host filesystem and network"
            ),
        }
    } else if limits.require_namespaces {
        return Err("Namespace confinement is not supported on this platform".to_string());
    }
    try_interpreter(options, false).await.map(|()| false)
}

async fn try_interpreter(
    options: &WorkerOptions,
    confined: bool,
) -> std::result::Result<(), String> {
    let scratch = tempfile::tempdir().map_err(|e| format!("Failed to create scratch dir: {}", e))?;
    let mut command = options
        .command("", scratch.path(), confined)
        .ok_or_else(|| "No interpreter configured".to_string())?;
    command.stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to start {}: {}", options.interpreter[0], e))?;
    match tokio::time::timeout(STARTUP_CHECK_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(format!("Interpreter check exited with {}", status)),
        Ok(Err(e)) => Err(format!("Interpreter check failed: {}", e)),
        Err(_) => Err(format!(
            "Interpreter check did not finish within {:?}",
            STARTUP_CHECK_TIMEOUT
        )),
    }
}

async fn execute<W>(
    request: &ExecutionRequest,
    options: &WorkerOptions,
    confined: bool,
    sink: &mut FrameSink<W>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let run_id = request.run_id;
    tracing::debug!(run_id = %run_id, code_len = request.code.len(), "Running code");

    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            let message = format!("Failed to create scratch dir: {}", e);
            return send(sink, &WorkerMessage::Error { run_id, message }).await;
        }
    };
    let spawned = match options.command(&request.code, scratch.path(), confined) {
        Some(mut command) => command.spawn().map_err(|e| e.to_string()),
        None => Err("No interpreter configured".to_string()),
    };
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to spawn interpreter: {}", e);
            return send(sink, &WorkerMessage::Error { run_id, message }).await;
        }
    };
    let _group = ProcessGroup::adopt(options.isolate_process_group, child.id());

    let (line_tx, mut line_rx) = mpsc::channel(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, OutputStream::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, OutputStream::Stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut sequence = 0;
    let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Some((stream, text)) = line_rx.recv().await {
        if stream == OutputStream::Stderr {
            if stderr_tail.len() == STDERR_TAIL_LINES {
                stderr_tail.pop_front();
            }
            stderr_tail.push_back(text.clone());
        }
        let fragment = OutputFragment {
            run_id,
            sequence,
            stream,
            text,
        };
        sequence += 1;
        send(sink, &WorkerMessage::Output(fragment)).await?;
    }

    let message = match child.wait().await {
        Ok(status) if status.success() => None,
        Ok(status) => Some(failure_message(status, &stderr_tail)),
        Err(e) => Some(format!("Failed to wait for interpreter: {}", e)),
    };
    tracing::debug!(
        run_id = %run_id,
        fragments = sequence,
        failed = message.is_some(),
        "Run finished"
    );

    match message {
        None => send(sink, &WorkerMessage::Done { run_id }).await,
        Some(message) => send(sink, &WorkerMessage::Error { run_id, message }).await,
    }
}

fn failure_message(status: ExitStatus, stderr_tail: &VecDeque<String>) -> String {
    let stderr: String = stderr_tail.iter().map(String::as_str).collect();
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        format!("Process {}", status)
    } else {
        format!("{}\n(process {})", stderr, status)
    }
}

/// Forward chunks of a pipe, splitting at newlines or `MAX_CHUNK_BYTES`.
///
/// A chunk never ends inside a UTF-8 sequence: the truncated bytes are held
/// back and lead the next chunk.
async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let limit = MAX_CHUNK_BYTES - buf.len() as u64;
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let complete = buf.len() - incomplete_tail(&buf);
                if complete == 0 {
                    continue;
                }
                let text = String::from_utf8_lossy(&buf[..complete]).into_owned();
                buf.drain(..complete);
                if tx.send((stream, text)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe closed");
                break;
            }
        }
    }
    if !buf.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned())).await;
    }
}

/// Length of a multi-byte character cut off at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Kills an interpreter's whole process group when dropped
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: u32,
}

impl ProcessGroup {
    fn adopt(enabled: bool, pid: Option<u32>) -> Option<Self> {
        match (enabled, pid) {
            (true, Some(pgid)) => Some(Self { pgid }),
            _ => None,
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(self.pgid as i32), Signal::SIGKILL);
        }
    }
}
