//! End-to-end runs through real worker processes

use crate::common::{setup_test_logging, wait_for_state, worker_binary};
use assert_matches::assert_matches;
use sandpit_sandbox::{
    ExecutionOutcome, LocalRuntime, NullObserver, ProcessRuntime, Runtime, SandboxConfig,
    SandboxController, SandboxLifecycleState, WorkerConfig,
};
use std::time::Duration;

/// Alive and not a zombie
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// A background grandchild must die with its timed-out context
async fn assert_timeout_kills_descendants<R: Runtime + 'static>(runtime: R) {
    let config = SandboxConfig::default().with_timeout_ms(500);
    let controller = SandboxController::new(runtime, config, NullObserver);

    let outcome = controller.execute("sleep 30 & echo $!; wait").await.unwrap();
    let pid: u32 = assert_matches!(
        outcome,
        ExecutionOutcome::TimedOut { output } => output.trim().parse().unwrap()
    );
    wait_for_state(&controller, SandboxLifecycleState::Unloaded).await;

    #[cfg(target_os = "linux")]
    {
        let mut alive = true;
        for _ in 0..100 {
            alive = process_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!alive, "grandchild {} survived the timeout", pid);
    }

    assert!(controller.execute("echo recovered").await.unwrap().success());
}

#[tokio::test]
async fn test_local_runtime_timeout_kills_descendants() {
    setup_test_logging();
    assert_timeout_kills_descendants(LocalRuntime::default()).await;
}

#[tokio::test]
async fn test_process_runtime_end_to_end() {
    setup_test_logging();
    let Some(program) = worker_binary() else {
        eprintln!("sandpit-worker binary not built; skipping");
        return;
    };
    let worker = WorkerConfig {
        program: Some(program),
        ..WorkerConfig::default()
    };

    let controller = SandboxController::new(
        ProcessRuntime::from_config(&worker),
        SandboxConfig::default(),
        NullObserver,
    );
    // Both streams land in the console; their relative order is not fixed
    let outcome = controller.execute("echo hello; echo oops >&2").await.unwrap();
    assert_matches!(&outcome, ExecutionOutcome::Completed { output } => {
        assert!(output.contains("hello\n"));
        assert!(output.contains("oops\n"));
    });
    assert_matches!(
        controller.execute("exit 7").await.unwrap(),
        ExecutionOutcome::RuntimeError { message, .. } if message.contains("7")
    );
    controller.teardown().await;

    assert_timeout_kills_descendants(ProcessRuntime::from_config(&worker)).await;
}
