//! Common test utilities shared across integration and E2E tests

use sandpit_sandbox::testing::{ScriptedRuntime, ScriptedWorker};
use sandpit_sandbox::{
    ChannelObserver, LocalRuntime, SandboxConfig, SandboxController, SandboxEvent,
    SandboxLifecycleState,
};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Controller evaluating code with `/bin/sh -c` in-process
pub fn shell_controller(
    config: SandboxConfig,
) -> (SandboxController, UnboundedReceiver<SandboxEvent>) {
    let (observer, events) = ChannelObserver::new();
    let runtime = LocalRuntime::from_config(&config.worker);
    (SandboxController::new(runtime, config, observer), events)
}

/// Controller whose contexts are played by the test
pub fn scripted_controller(
    config: SandboxConfig,
) -> (SandboxController, UnboundedReceiver<ScriptedWorker>) {
    let (runtime, workers) = ScriptedRuntime::new();
    (
        SandboxController::new(runtime, config, sandpit_sandbox::NullObserver),
        workers,
    )
}

pub async fn wait_for_state(controller: &SandboxController, state: SandboxLifecycleState) {
    let mut rx = controller.subscribe();
    rx.wait_for(|s| *s == state)
        .await
        .expect("controller stopped");
}

pub fn drain(events: &mut UnboundedReceiver<SandboxEvent>) -> Vec<SandboxEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// The `sandpit-worker` binary built next to the test executable, if present
pub fn worker_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    // target/<profile>/deps/<test> -> target/<profile>/sandpit-worker
    let path = exe.parent()?.parent()?.join("sandpit-worker");
    path.is_file().then_some(path)
}
