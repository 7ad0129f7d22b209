use shutdown_gate::{GateConfig, GatedPool, ShutdownGate, ShutdownPolicy, TaskHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn work_task_fn(id: usize, policy: ShutdownPolicy, duration_ms: u64) -> String {
  info!("Task {} ({}) starting (will run for {}ms)", id, policy, duration_ms);
  tokio::time::sleep(Duration::from_millis(duration_ms)).await;
  let result = format!("Task {} ({}) finished after {}ms", id, policy, duration_ms);
  info!("{}", result);
  result
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Gated Pool Shutdown Example ---");

  let gate = Arc::new(ShutdownGate::new(GateConfig::default().with_name("demo_gate")));
  let pool = GatedPool::<String>::new(2, 10, Handle::current(), gate.clone());

  let mut handles: Vec<TaskHandle<String>> = Vec::new();

  // Two tasks start right away, the rest wait in the queue.
  let plan = [
    ShutdownPolicy::BlockShutdown,
    ShutdownPolicy::SkipOnShutdown,
    ShutdownPolicy::SkipOnShutdown,
    ShutdownPolicy::ContinueOnShutdown,
    ShutdownPolicy::BlockShutdown,
  ];
  for (i, policy) in plan.into_iter().enumerate() {
    let future = Box::pin(work_task_fn(i, policy, 1000));
    match pool.submit(policy, future).await {
      Ok(handle) => handles.push(handle),
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  tokio::time::sleep(Duration::from_millis(100)).await;
  info!(
    "Queue size: {}, Active: {}, Blocking: {}",
    pool.queued_task_count(),
    pool.active_task_count(),
    gate.blocking_count()
  );

  let shutdown_jh = tokio::spawn(pool.clone().shutdown());
  tokio::time::sleep(Duration::from_millis(50)).await;

  // Only BLOCK_SHUTDOWN work is still accepted while shutting down.
  for policy in ShutdownPolicy::ALL {
    let future = Box::pin(work_task_fn(99, policy, 100));
    match pool.submit(policy, future).await {
      Ok(handle) => {
        info!("Late {} task admitted.", policy);
        handles.push(handle);
      }
      Err(e) => info!("Late {} task refused: {}", policy, e),
    }
  }

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(result) => info!("Task {} result: {}", task_id, result),
      Err(e) => info!("Task {} did not run to completion: {}", task_id, e),
    }
  }

  shutdown_jh
    .await
    .expect("Shutdown task panicked")
    .expect("Shutdown failed");
  info!("Gate state after shutdown: {:?}", gate.state());
  info!("--- Gated Pool Shutdown Example End ---");
}
