//! In-process runtime - the worker loop runs on a task behind in-memory pipes

use super::{ContextConnection, Terminator};
use crate::config::WorkerConfig;
use crate::worker::{self, WorkerOptions};
use crate::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Runs contexts without spawning a worker binary. Submitted code still runs
/// in separate interpreter processes; only the channel endpoint is in-process.
pub struct LocalRuntime {
    options: WorkerOptions,
}

impl LocalRuntime {
    pub fn new(mut options: WorkerOptions) -> Self {
        // Aborting the serve task cannot kill a group we are part of
        options.isolate_process_group = true;
        Self { options }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(WorkerOptions::from_config(config))
    }

    pub fn with_interpreter<I, S>(interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(WorkerOptions::with_interpreter(interpreter))
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new(WorkerOptions::default())
    }
}

#[async_trait]
impl super::Runtime for LocalRuntime {
    async fn connect(&self) -> Result<ContextConnection> {
        let (host_side, worker_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (host_read, host_write) = tokio::io::split(host_side);

        let options = self.options.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = worker::serve(worker_read, worker_write, options).await {
                tracing::warn!(error = %e, "Local worker stopped");
            }
        });

        Ok(ContextConnection {
            reader: Box::new(host_read),
            writer: Box::new(host_write),
            terminator: Box::new(TaskTerminator { task: Some(task) }),
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

struct TaskTerminator {
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Terminator for TaskTerminator {
    async fn terminate(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Wait so the interpreter guard has run before we report the context gone
            let _ = task.await;
        }
    }
}

impl Drop for TaskTerminator {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
