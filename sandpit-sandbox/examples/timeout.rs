//! Timeout example - a runaway program is cut off and the context recreated

use sandpit_sandbox::{ChannelObserver, LocalRuntime, SandboxConfig, SandboxController};
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let (observer, mut events) = ChannelObserver::new();
    let config = SandboxConfig::default().with_timeout_ms(1500);
    let controller = SandboxController::new(LocalRuntime::default(), config, observer);

    println!("=== Timeout Example ===\n");

    let started = Instant::now();
    let outcome = controller
        .execute("echo 'about to spin'; while true; do :; done")
        .await?;
    println!(
        "Runaway program: {:?} after {}ms",
        outcome,
        started.elapsed().as_millis()
    );
    println!("State afterwards: {}", controller.state());

    let outcome = controller.execute("echo 'fresh context'").await?;
    println!("Next program: {:?}", outcome);

    controller.teardown().await;

    println!("\nNotifications:");
    while let Ok(event) = events.try_recv() {
        println!("  {:?}", event);
    }
    Ok(())
}
