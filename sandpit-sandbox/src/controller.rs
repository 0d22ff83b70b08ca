//! Sandbox controller - the host-facing entry point
//!
//! A [`SandboxController`] is a cheap handle to a driver task that exclusively
//! owns the isolated context, the console and the timeout supervisor. All
//! state changes happen on that task, one message at a time, so the handle
//! itself never touches sandbox state.

use crate::config::SandboxConfig;
use crate::console::Console;
use crate::context::{IsolatedContext, RequestFrame};
use crate::error::SandboxError;
use crate::observer::SandboxObserver;
use crate::runtime::Runtime;
use crate::settle::Settlement;
use crate::supervisor::TimeoutSupervisor;
use crate::types::{ExecutionOutcome, SandboxLifecycleState};
use crate::Result;
use sandpit_common::{ExecutionRequest, RunId, WorkerMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

const COMMAND_BUFFER: usize = 16;

type Reply<T> = oneshot::Sender<Result<T>>;
type RunSettlement = Settlement<Result<ExecutionOutcome>>;

enum Command {
    Start(Reply<()>),
    Execute {
        code: String,
        reply: Reply<ExecutionOutcome>,
    },
    Teardown(oneshot::Sender<()>),
    Recreate(Reply<()>),
}

/// Handle used by the host to run untrusted code
#[derive(Clone)]
pub struct SandboxController {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SandboxLifecycleState>,
}

impl SandboxController {
    /// Create a controller. Must be called within a tokio runtime.
    ///
    /// Nothing is loaded until [`start`](Self::start) or the first
    /// [`execute`](Self::execute).
    pub fn new<R, O>(runtime: R, config: SandboxConfig, observer: O) -> Self
    where
        R: Runtime + 'static,
        O: SandboxObserver + 'static,
    {
        Self::from_parts(Arc::new(runtime), config, Arc::new(observer))
    }

    pub fn from_parts(
        runtime: Arc<dyn Runtime>,
        config: SandboxConfig,
        observer: Arc<dyn SandboxObserver>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(SandboxLifecycleState::Unloaded);
        let driver = Driver::new(runtime, config, observer, state_tx, commands_rx);
        tokio::spawn(driver.run());
        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Load the context ahead of the first execution
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    /// Run `code` and wait for its single terminal outcome.
    ///
    /// Rejected with [`SandboxError::Busy`] while another execution or a
    /// context load is in flight.
    pub async fn execute(&self, code: impl Into<String>) -> Result<ExecutionOutcome> {
        let code = code.into();
        self.request(|reply| Command::Execute { code, reply }).await?
    }

    /// Kill the context and cancel any pending execution. The controller
    /// stays terminated until [`recreate`](Self::recreate).
    pub async fn teardown(&self) {
        let _ = self.request(Command::Teardown).await;
    }

    /// Leave the terminated state so a fresh context can be created
    pub async fn recreate(&self) -> Result<()> {
        self.request(Command::Recreate).await?
    }

    pub fn state(&self) -> SandboxLifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxLifecycleState> {
        self.state.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SandboxError::ControllerGone)?;
        rx.await.map_err(|_| SandboxError::ControllerGone)
    }
}

struct PendingLoad {
    generation: u64,
    waiters: Vec<Reply<()>>,
    /// The execution that triggered the load
    queued: Option<(RequestFrame, RunSettlement)>,
}

struct ActiveRun {
    run_id: RunId,
    settlement: RunSettlement,
}

struct Loaded {
    generation: u64,
    result: Result<IsolatedContext>,
}

enum ContextEvent {
    Message(WorkerMessage),
    Closed,
}

struct Driver {
    runtime: Arc<dyn Runtime>,
    config: SandboxConfig,
    observer: Arc<dyn SandboxObserver>,
    state: watch::Sender<SandboxLifecycleState>,
    commands: mpsc::Receiver<Command>,
    context: Option<IsolatedContext>,
    console: Console,
    supervisor: TimeoutSupervisor,
    expirations: mpsc::UnboundedReceiver<RunId>,
    loads_tx: mpsc::Sender<Loaded>,
    loads_rx: mpsc::Receiver<Loaded>,
    generation: u64,
    pending_load: Option<PendingLoad>,
    active: Option<ActiveRun>,
}

impl Driver {
    fn new(
        runtime: Arc<dyn Runtime>,
        config: SandboxConfig,
        observer: Arc<dyn SandboxObserver>,
        state: watch::Sender<SandboxLifecycleState>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (supervisor, expirations) = TimeoutSupervisor::new();
        let (loads_tx, loads_rx) = mpsc::channel(4);
        Self {
            console: Console::new(config.max_output_bytes),
            runtime,
            config,
            observer,
            state,
            commands,
            context: None,
            supervisor,
            expirations,
            loads_tx,
            loads_rx,
            generation: 0,
            pending_load: None,
            active: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.context) => self.on_context_event(event).await,
                Some(run_id) = self.expirations.recv() => self.on_expiry(run_id).await,
                Some(loaded) = self.loads_rx.recv() => self.on_loaded(loaded).await,
            }
        }
        tracing::debug!("All controller handles dropped");
        self.shut_down().await;
    }

    fn current(&self) -> SandboxLifecycleState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SandboxLifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Sandbox state changed");
        }
    }

    async fn on_command(&mut self, command: Command) {
        use SandboxLifecycleState::*;

        match command {
            Command::Start(reply) => match self.current() {
                Terminated => {
                    let _ = reply.send(Err(SandboxError::Terminated));
                }
                Ready | Executing => {
                    let _ = reply.send(Ok(()));
                }
                Loading => match self.pending_load.as_mut() {
                    Some(load) => load.waiters.push(reply),
                    None => {
                        let _ = reply.send(Err(SandboxError::Busy));
                    }
                },
                Unloaded => self.begin_load().waiters.push(reply),
            },
            Command::Execute { code, reply } => match self.current() {
                Terminated => {
                    let _ = reply.send(Err(SandboxError::Terminated));
                }
                state @ (Loading | Executing) => {
                    tracing::debug!(state = %state, "Rejecting execution: busy");
                    let _ = reply.send(Err(SandboxError::Busy));
                }
                state @ (Unloaded | Ready) => {
                    let frame = match RequestFrame::encode(ExecutionRequest::new(code)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "Rejecting execution");
                            let _ = reply.send(Err(e));
                            return;
                        }
                    };
                    let settlement = Settlement::from_sender(reply);
                    if state == Unloaded {
                        self.begin_load().queued = Some((frame, settlement));
                    } else {
                        self.dispatch(frame, settlement).await;
                    }
                }
            },
            Command::Teardown(reply) => {
                self.shut_down().await;
                let _ = reply.send(());
            }
            Command::Recreate(reply) => {
                if self.current() == Terminated {
                    tracing::info!("Sandbox recreated");
                    self.set_state(Unloaded);
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn begin_load(&mut self) -> &mut PendingLoad {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(SandboxLifecycleState::Loading);
        self.observer.on_load_start();

        let runtime = self.runtime.clone();
        let load_timeout = self.config.load_timeout;
        let loads = self.loads_tx.clone();
        tokio::spawn(async move {
            let result = IsolatedContext::start(runtime.as_ref(), load_timeout).await;
            if let Err(mpsc::error::SendError(Loaded {
                result: Ok(context),
                ..
            })) = loads.send(Loaded { generation, result }).await
            {
                context.terminate().await;
            }
        });

        self.pending_load.insert(PendingLoad {
            generation,
            waiters: Vec::new(),
            queued: None,
        })
    }

    async fn on_loaded(&mut self, loaded: Loaded) {
        let current = self.pending_load.as_ref().map(|load| load.generation);
        if current != Some(loaded.generation) {
            tracing::debug!(generation = loaded.generation, "Discarding stale context load");
            if let Ok(context) = loaded.result {
                context.terminate().await;
            }
            return;
        }
        let Some(pending) = self.pending_load.take() else {
            return;
        };

        match loaded.result {
            Ok(context) => {
                self.context = Some(context);
                self.set_state(SandboxLifecycleState::Ready);
                self.observer.on_load_end();
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(()));
                }
                if let Some((frame, settlement)) = pending.queued {
                    self.dispatch(frame, settlement).await;
                }
            }
            Err(error) => {
                let message = match &error {
                    SandboxError::LoadFailure(message) => message.clone(),
                    other => other.to_string(),
                };
                self.set_state(SandboxLifecycleState::Unloaded);
                self.observer.on_load_failed(&message);
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                if let Some((_, settlement)) = pending.queued {
                    settlement.settle(Err(error));
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: RequestFrame, settlement: RunSettlement) {
        let run_id = frame.run_id();
        self.console.start_run(run_id);
        self.observer.on_output("");
        self.set_state(SandboxLifecycleState::Executing);
        self.supervisor.arm(run_id, self.config.timeout);
        self.active = Some(ActiveRun { run_id, settlement });

        tracing::info!(
            run_id = %run_id,
            runtime = self.runtime.name(),
            code_len = frame.code_len(),
            "Executing code"
        );

        let sent = match self.context.as_mut() {
            Some(context) => context.send(frame).await.map_err(|e| e.to_string()),
            None => Err("No context loaded".to_string()),
        };
        if let Err(e) = sent {
            self.lose_context(format!("Failed to send request: {}", e)).await;
        }
    }

    async fn on_context_event(&mut self, event: ContextEvent) {
        match event {
            ContextEvent::Message(message) => self.on_worker_message(message),
            ContextEvent::Closed => self.lose_context("Execution channel closed".to_string()).await,
        }
    }

    fn on_worker_message(&mut self, message: WorkerMessage) {
        let Some(run_id) = self.active.as_ref().map(|run| run.run_id) else {
            tracing::trace!(?message, "Discarding message while idle");
            return;
        };
        if message.run_id() != Some(run_id) {
            tracing::debug!(run_id = ?message.run_id(), "Discarding stale message");
            return;
        }

        match message {
            WorkerMessage::Output(fragment) => {
                if self.console.append(&fragment) {
                    self.observer.on_output(self.console.text());
                }
            }
            WorkerMessage::Done { .. } => self.complete(run_id, None),
            WorkerMessage::Error { message, .. } => self.complete(run_id, Some(message)),
            WorkerMessage::Ready { .. } | WorkerMessage::LoadFailed { .. } => {}
        }
    }

    /// Terminal message from the context
    fn complete(&mut self, run_id: RunId, error: Option<String>) {
        if !self.supervisor.disarm(run_id) {
            // The timer won; its expiry is already queued for us
            tracing::debug!(run_id = %run_id, "Terminal message lost the race to the timeout");
            return;
        }
        let Some(run) = self.active.take() else {
            return;
        };

        self.console.seal(run_id);
        let output = self.console.text().to_string();
        let outcome = match error {
            None => ExecutionOutcome::Completed { output },
            Some(message) => ExecutionOutcome::RuntimeError { message, output },
        };
        tracing::info!(
            run_id = %run_id,
            outcome = outcome.kind(),
            truncated = self.console.is_truncated(),
            "Execution finished"
        );
        self.set_state(SandboxLifecycleState::Ready);
        run.settlement.settle(Ok(outcome));
    }

    async fn on_expiry(&mut self, run_id: RunId) {
        match &self.active {
            Some(run) if run.run_id == run_id => {}
            _ => {
                tracing::debug!(run_id = %run_id, "Ignoring expiry for inactive run");
                return;
            }
        }
        let Some(run) = self.active.take() else {
            return;
        };

        self.console.seal(run_id);
        let output = self.console.text().to_string();
        tracing::warn!(
            run_id = %run_id,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Execution timed out; discarding context"
        );
        run.settlement.settle(Ok(ExecutionOutcome::TimedOut { output }));
        self.discard_context().await;
    }

    /// The context died or became unreachable
    async fn lose_context(&mut self, message: String) {
        match self.active.take() {
            Some(run) => {
                self.console.seal(run.run_id);
                let outcome = if self.supervisor.disarm(run.run_id) {
                    ExecutionOutcome::ContextLost {
                        message: message.clone(),
                    }
                } else {
                    ExecutionOutcome::TimedOut {
                        output: self.console.text().to_string(),
                    }
                };
                tracing::warn!(
                    run_id = %run.run_id,
                    error = %message,
                    outcome = outcome.kind(),
                    "Context lost during execution"
                );
                run.settlement.settle(Ok(outcome));
            }
            None => tracing::warn!(error = %message, "Idle context lost"),
        }
        self.discard_context().await;
    }

    /// Kill the current context; the next call recreates it
    async fn discard_context(&mut self) {
        self.set_state(SandboxLifecycleState::Terminated);
        if let Some(context) = self.context.take() {
            context.terminate().await;
        }
        self.set_state(SandboxLifecycleState::Unloaded);
    }

    async fn shut_down(&mut self) {
        // Loads still in flight are now stale
        self.generation += 1;
        if let Some(pending) = self.pending_load.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SandboxError::Terminated));
            }
            if let Some((_, settlement)) = pending.queued {
                settlement.settle(Ok(ExecutionOutcome::Cancelled));
            }
        }

        if let Some(run) = self.active.take() {
            self.console.seal(run.run_id);
            // A timer that already fired has its expiry queued behind us
            let outcome = if self.supervisor.disarm(run.run_id) {
                tracing::info!(run_id = %run.run_id, "Cancelling pending execution");
                ExecutionOutcome::Cancelled
            } else {
                tracing::info!(run_id = %run.run_id, "Execution timed out before teardown");
                ExecutionOutcome::TimedOut {
                    output: self.console.text().to_string(),
                }
            };
            run.settlement.settle(Ok(outcome));
        }
        self.supervisor.disarm_all();
        if let Some(context) = self.context.take() {
            context.terminate().await;
        }
        self.set_state(SandboxLifecycleState::Terminated);
    }
}

async fn next_event(context: &mut Option<IsolatedContext>) -> ContextEvent {
    match context {
        Some(context) => match context.recv().await {
            Some(message) => ContextEvent::Message(message),
            None => ContextEvent::Closed,
        },
        None => std::future::pending().await,
    }
}
