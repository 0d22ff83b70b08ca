//! Simple sandbox example - run a few snippets and print their outcomes

use sandpit_sandbox::{
    ExecutionOutcome, LocalRuntime, SandboxConfig, SandboxController, SandboxObserver,
};

/// Prints lifecycle notifications as they happen
struct PrintObserver;

impl SandboxObserver for PrintObserver {
    fn on_load_start(&self) {
        println!("  [loading context]");
    }

    fn on_load_end(&self) {
        println!("  [context ready]");
    }

    fn on_load_failed(&self, message: &str) {
        println!("  [context failed: {}]", message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let controller = SandboxController::new(
        LocalRuntime::default(),
        SandboxConfig::default(),
        PrintObserver,
    );

    println!("=== Sandbox Controller Example ===\n");

    println!("Example 1: Simple echo");
    run(&controller, "echo 'Hello from sandbox!'").await?;

    println!("\nExample 2: Count to 5");
    run(&controller, "for i in 1 2 3 4 5; do echo $i; done").await?;

    println!("\nExample 3: Nothing leaks between runs");
    run(&controller, "echo secret > note.txt; export LEAK=1").await?;
    run(&controller, "cat note.txt; echo \"LEAK=${LEAK:-unset}\"").await?;

    println!("\nExample 4: Runtime error");
    run(&controller, "echo 'Error message' >&2; exit 1").await?;

    controller.teardown().await;
    Ok(())
}

async fn run(controller: &SandboxController, code: &str) -> anyhow::Result<()> {
    let outcome = controller.execute(code).await?;
    match &outcome {
        ExecutionOutcome::Completed { output } => print!("{}", output),
        ExecutionOutcome::RuntimeError { message, output } => {
            print!("{}", output);
            println!("  Error: {}", message);
        }
        other => println!("  {:?}", other),
    }
    println!("  Result: {}", outcome.kind());
    Ok(())
}
