//! Timing races between terminal messages, expiry and teardown

use crate::common::{scripted_controller, setup_test_logging, wait_for_state};
use sandpit_common::{HostMessage, OutputFragment, RunId, WorkerMessage};
use sandpit_sandbox::testing::ScriptedWorker;
use sandpit_sandbox::{ExecutionOutcome, SandboxConfig, SandboxLifecycleState};
use std::collections::HashSet;
use std::time::Duration;

async fn next_run(worker: &mut ScriptedWorker) -> RunId {
    match worker.next_request().await {
        Some(HostMessage::Execute(request)) => request.run_id,
        other => panic!("expected execute request, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_done_at_deadline_settles_exactly_once() {
    setup_test_logging();
    let (controller, mut workers) = scripted_controller(SandboxConfig::default());

    let exec = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute("race").await })
    };
    let mut worker = workers.recv().await.unwrap();
    worker.ready().await;
    let run_id = next_run(&mut worker).await;

    // Wake up on the same tick as the supervisor
    tokio::time::sleep(Duration::from_millis(3000)).await;
    worker
        .send(WorkerMessage::Output(OutputFragment::stdout(run_id, 0, "x")))
        .await;
    worker.send(WorkerMessage::Done { run_id }).await;

    match exec.await.unwrap().unwrap() {
        ExecutionOutcome::Completed { .. } => {
            assert_eq!(controller.state(), SandboxLifecycleState::Ready);
            assert!(!worker.was_terminated());
        }
        ExecutionOutcome::TimedOut { .. } => {
            wait_for_state(&controller, SandboxLifecycleState::Unloaded).await;
            assert!(worker.was_terminated());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_done_just_after_deadline_is_ignored() {
    setup_test_logging();
    let (controller, mut workers) = scripted_controller(SandboxConfig::default());

    let exec = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute("slow").await })
    };
    let mut worker = workers.recv().await.unwrap();
    worker.ready().await;
    let run_id = next_run(&mut worker).await;

    tokio::time::sleep(Duration::from_millis(3001)).await;
    worker.send(WorkerMessage::Done { run_id }).await;

    assert_eq!(
        exec.await.unwrap(),
        Ok(ExecutionOutcome::TimedOut {
            output: String::new()
        })
    );
}

#[tokio::test]
async fn test_every_run_gets_a_fresh_id() {
    setup_test_logging();
    let (controller, mut workers) = scripted_controller(SandboxConfig::default());
    let start = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start().await })
    };
    let mut worker = workers.recv().await.unwrap();
    worker.ready().await;
    start.await.unwrap().unwrap();

    let mut seen = HashSet::new();
    for i in 0..20 {
        let exec = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.execute(format!("echo {}", i)).await })
        };
        let run_id = next_run(&mut worker).await;
        assert!(seen.insert(run_id), "run id reused");
        worker.send(WorkerMessage::Done { run_id }).await;
        assert!(exec.await.unwrap().unwrap().success());
    }
}

#[tokio::test]
async fn test_dropping_every_handle_terminates_context() {
    setup_test_logging();
    let (controller, mut workers) = scripted_controller(SandboxConfig::default());
    let start = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start().await })
    };
    let mut worker = workers.recv().await.unwrap();
    worker.ready().await;
    start.await.unwrap().unwrap();

    drop(controller);
    for _ in 0..100 {
        if worker.was_terminated() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(worker.was_terminated());
}

#[tokio::test]
async fn test_late_ready_from_abandoned_load_is_ignored() {
    setup_test_logging();
    let (controller, mut workers) = scripted_controller(SandboxConfig::default());

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute("first").await })
    };
    let mut abandoned = workers.recv().await.unwrap();
    controller.teardown().await;
    assert_eq!(first.await.unwrap(), Ok(ExecutionOutcome::Cancelled));

    controller.recreate().await.unwrap();
    let second = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute("second").await })
    };
    let mut fresh = workers.recv().await.unwrap();

    // The abandoned context finishes loading after its replacement started
    abandoned.ready().await;
    fresh.ready().await;
    let run_id = next_run(&mut fresh).await;
    fresh.send(WorkerMessage::Done { run_id }).await;

    assert!(second.await.unwrap().unwrap().success());
    assert_eq!(abandoned.next_request().await, None);
    assert!(abandoned.was_terminated());
}
