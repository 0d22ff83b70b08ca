//! Controller scenarios against a real `/bin/sh` interpreter

use crate::common::{drain, setup_test_logging, shell_controller, wait_for_state};
use assert_matches::assert_matches;
use sandpit_sandbox::{
    ExecutionOutcome, LocalRuntime, NullObserver, SandboxConfig, SandboxController,
    SandboxError, SandboxEvent, SandboxLifecycleState, TRUNCATION_MARKER,
};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_simple_program_completes() {
    setup_test_logging();
    let (controller, mut events) = shell_controller(SandboxConfig::default());

    let outcome = controller.execute("echo $((1 + 1))").await.unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            output: "2\n".into()
        }
    );
    assert_eq!(controller.state(), SandboxLifecycleState::Ready);

    let events = drain(&mut events);
    assert_eq!(events[0], SandboxEvent::LoadStart);
    assert_eq!(events[1], SandboxEvent::LoadEnd);
    assert_eq!(events[2], SandboxEvent::Output(String::new()));
    assert_eq!(events.last(), Some(&SandboxEvent::Output("2\n".into())));
}

#[tokio::test]
async fn test_runtime_error_keeps_context_ready() {
    setup_test_logging();
    let (controller, mut events) = shell_controller(SandboxConfig::default());

    let outcome = controller
        .execute("echo before; echo 'boom' >&2; exit 3")
        .await
        .unwrap();
    assert_matches!(&outcome, ExecutionOutcome::RuntimeError { message, output } => {
        assert!(message.contains("boom"), "message: {}", message);
        assert!(output.contains("before"));
    });
    assert_eq!(controller.state(), SandboxLifecycleState::Ready);
    drain(&mut events);

    let outcome = controller.execute("echo after").await.unwrap();
    assert!(outcome.success());
    // Still the same context: no reload
    assert!(!drain(&mut events).contains(&SandboxEvent::LoadStart));
}

#[tokio::test]
async fn test_runaway_program_times_out_and_context_is_recreated() {
    setup_test_logging();
    let config = SandboxConfig::default().with_timeout_ms(500);
    let (controller, mut events) = shell_controller(config);

    let started = Instant::now();
    let outcome = controller
        .execute("echo started; while true; do :; done")
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert_matches!(&outcome, ExecutionOutcome::TimedOut { output } => {
        assert_eq!(output, "started\n");
    });
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);

    wait_for_state(&controller, SandboxLifecycleState::Unloaded).await;
    drain(&mut events);

    let outcome = controller.execute("echo fresh").await.unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            output: "fresh\n".into()
        }
    );
    let events = drain(&mut events);
    assert_eq!(events[0], SandboxEvent::LoadStart);
    assert_eq!(events[1], SandboxEvent::LoadEnd);
}

#[tokio::test]
async fn test_runs_share_no_state() {
    setup_test_logging();
    let (controller, _events) = shell_controller(SandboxConfig::default());

    let outcome = controller
        .execute("echo secret > note.txt; export LEAK=1; echo $LEAK")
        .await
        .unwrap();
    assert_eq!(outcome.output(), Some("1\n"));

    let outcome = controller
        .execute("ls; echo \"LEAK=${LEAK:-unset}\"")
        .await
        .unwrap();
    assert_eq!(outcome.output(), Some("LEAK=unset\n"));
}

#[tokio::test]
async fn test_output_is_truncated_at_cap() {
    setup_test_logging();
    let config = SandboxConfig {
        max_output_bytes: 100,
        ..SandboxConfig::default()
    };
    let (controller, _events) = shell_controller(config);

    let outcome = controller
        .execute("i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done")
        .await
        .unwrap();
    let output = outcome.output().unwrap();
    assert!(outcome.success());
    assert!(output.ends_with(TRUNCATION_MARKER));
    assert_eq!(output.matches(TRUNCATION_MARKER).count(), 1);
    assert!(output.len() <= 100 + TRUNCATION_MARKER.len());
    assert!(output.starts_with("line0\n"));
}

#[tokio::test]
async fn test_second_execute_while_running_is_busy() {
    setup_test_logging();
    let (controller, _events) = shell_controller(SandboxConfig::default());
    tokio_test::assert_ok!(controller.start().await);

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute("sleep 0.3; echo done").await })
    };
    wait_for_state(&controller, SandboxLifecycleState::Executing).await;

    assert_eq!(
        controller.execute("echo intruder").await,
        Err(SandboxError::Busy)
    );
    assert_eq!(
        running.await.unwrap().unwrap(),
        ExecutionOutcome::Completed {
            output: "done\n".into()
        }
    );
}

#[tokio::test]
async fn test_teardown_cancels_running_program() {
    setup_test_logging();
    let (controller, _events) = shell_controller(SandboxConfig::default());

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute("sleep 30").await })
    };
    wait_for_state(&controller, SandboxLifecycleState::Executing).await;

    controller.teardown().await;
    assert_eq!(running.await.unwrap(), Ok(ExecutionOutcome::Cancelled));
    assert_eq!(controller.state(), SandboxLifecycleState::Terminated);
    assert_eq!(
        controller.execute("echo hi").await,
        Err(SandboxError::Terminated)
    );

    tokio_test::assert_ok!(controller.recreate().await);
    assert!(controller.execute("echo hi").await.unwrap().success());
}

#[tokio::test]
async fn test_missing_interpreter_is_load_failure() {
    setup_test_logging();
    let controller = SandboxController::new(
        LocalRuntime::with_interpreter(["/nonexistent/interpreter", "-c"]),
        SandboxConfig::default(),
        NullObserver,
    );

    let result = controller.execute("echo hi").await;
    assert_matches!(result, Err(SandboxError::LoadFailure(message)) => {
        assert!(message.contains("/nonexistent/interpreter"));
    });
    assert_eq!(controller.state(), SandboxLifecycleState::Unloaded);
}

#[tokio::test]
async fn test_temp_files_do_not_carry_over_between_runs() {
    setup_test_logging();
    let mut config = SandboxConfig::default();
    config.worker.limits.require_namespaces = true;
    let (controller, _events) = shell_controller(config);

    let outcome = match controller.execute("echo leaked > /tmp/carried_over").await {
        Err(SandboxError::LoadFailure(message)) => {
            eprintln!("namespaces unavailable ({}); skipping", message);
            return;
        }
        other => other.unwrap(),
    };
    assert!(outcome.success());

    let outcome = controller
        .execute("cat /tmp/carried_over 2>/dev/null || echo missing")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            output: "missing\n".into()
        }
    );
}

#[tokio::test]
async fn test_oversized_code_keeps_context() {
    setup_test_logging();
    let (controller, mut events) = shell_controller(SandboxConfig::default());
    assert!(controller.execute("true").await.unwrap().success());
    drain(&mut events);

    let code = format!("echo {}", "x".repeat(sandpit_common::MAX_FRAME_BYTES));
    assert_matches!(
        controller.execute(code).await,
        Err(SandboxError::CodeTooLarge { .. })
    );
    assert_eq!(controller.state(), SandboxLifecycleState::Ready);

    assert!(controller.execute("echo still").await.unwrap().success());
    assert!(!drain(&mut events).contains(&SandboxEvent::LoadStart));
}
