use crate::error::PoolError;
use crate::gate::{ExecutionGuard, ShutdownGate};
use crate::handle::TaskHandle;
use crate::policy::ShutdownPolicy;
use crate::task::{ManagedTaskInternal, TaskToExecute};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use fibre::oneshot;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

type ActiveTaskMap = DashMap<u64, (CancellationToken, ShutdownPolicy)>;

/// A Tokio-based task pool whose admission and execution are gated by a
/// [`ShutdownGate`].
///
/// Tasks are admitted through the gate before they become visible in the
/// bounded queue, and every dequeued task asks the gate whether it may run.
/// [`shutdown`](Self::shutdown) waits for the gate on a blocking thread while
/// the worker keeps draining, so queued `BlockShutdown` tasks still run.
///
/// `BlockShutdown` tasks need a concurrency slot to run. A pool whose slots
/// are all held by never-ending `ContinueOnShutdown` tasks cannot finish
/// shutting down.
pub struct GatedPool<R: Send + 'static> {
  pool_name: Arc<String>,
  gate: Arc<ShutdownGate>,
  producer: QueueProducer<R>,
  active_task_info: Arc<ActiveTaskMap>,
  shutdown_initiated: AtomicBool,
  worker_join_handle_internal: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Send + 'static> GatedPool<R> {
  pub fn new(
    concurrency_limit: usize,
    queue_capacity: usize,
    tokio_handle: TokioHandle,
    gate: Arc<ShutdownGate>,
  ) -> Arc<Self> {
    let (producer, consumer) = TaskQueue::new(queue_capacity).split();
    let pool_name = Arc::new(gate.name().to_string());
    let active_task_info = Arc::new(DashMap::new());

    let worker_loop_join_handle = tokio_handle.spawn(
      Self::run_worker_loop(
        pool_name.clone(),
        gate.clone(),
        Arc::new(Semaphore::new(concurrency_limit.max(1))),
        consumer,
        tokio_handle.clone(),
        active_task_info.clone(),
      )
      .instrument(info_span!("gated_pool_worker_loop", name = %pool_name)),
    );

    Arc::new(Self {
      pool_name,
      gate,
      producer,
      active_task_info,
      shutdown_initiated: AtomicBool::new(false),
      worker_join_handle_internal: Mutex::new(Some(worker_loop_join_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn gate(&self) -> &Arc<ShutdownGate> {
    &self.gate
  }

  pub fn active_task_count(&self) -> usize {
    self.active_task_info.len()
  }

  /// Returns the current number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.producer.len()
  }

  /// Admits `task_future` under `policy` and queues it.
  ///
  /// # Errors
  /// Returns `PoolError::TaskRejected` if the gate refused admission; the
  /// future is dropped without running.
  pub async fn submit(&self, policy: ShutdownPolicy, task_future: TaskToExecute<R>) -> Result<TaskHandle<R>, PoolError> {
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let token = CancellationToken::new();
    let (result_tx, result_rx) = oneshot::oneshot::<Result<R, PoolError>>();

    let managed_task_internal = ManagedTaskInternal {
      task_id,
      policy,
      future: task_future,
      token: token.clone(),
      result_sender: Some(result_tx),
    };

    match self.producer.send(managed_task_internal, &self.gate).await {
      Ok(()) => {
        debug!(pool_name = %self.pool_name, %task_id, %policy, "Task admitted and queued.");
        Ok(TaskHandle {
          task_id,
          policy,
          cancellation_token: token,
          result_receiver: Some(result_rx),
        })
      }
      Err(PoolError::TaskRejected) => {
        debug!(pool_name = %self.pool_name, %task_id, %policy, "Submit: Task not admitted because of shutdown.");
        Err(PoolError::TaskRejected)
      }
      Err(send_error) => {
        error!(pool_name = %self.pool_name, %task_id, "Submit: Failed to queue admitted task: {}", send_error);
        Err(send_error)
      }
    }
  }

  /// Shuts the gate down and stops the worker.
  ///
  /// Returns once every `BlockShutdown` task admitted so far and every running
  /// `SkipOnShutdown` task has finished. Queued tasks the gate refuses resolve
  /// to `PoolError::TaskSkipped`. `ContinueOnShutdown` tasks already running
  /// are left to finish on their own.
  pub async fn shutdown(self: Arc<Self>) -> Result<(), PoolError> {
    if self.shutdown_initiated.swap(true, AtomicOrdering::SeqCst) {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call.");
      return Ok(());
    }

    info!(pool_name = %self.pool_name, "Initiating pool shutdown. Waiting on gate.");
    let gate = self.gate.clone();
    let gate_result = tokio::task::spawn_blocking(move || gate.shutdown()).await;

    // The queue must be closed even if the blocking wait failed, or the worker never exits.
    self.producer.close();
    info!(pool_name = %self.pool_name, "Gate drained and task queue closed.");

    let handle_to_await = self.worker_join_handle_internal.lock().take();
    if let Some(handle) = handle_to_await {
      info!(pool_name = %self.pool_name, "Waiting for worker loop to join.");
      match handle.await {
        Ok(()) => info!(pool_name = %self.pool_name, "Worker loop successfully joined."),
        Err(join_error) => {
          error!(pool_name = %self.pool_name, "Error joining worker loop during shutdown: {:?}.", join_error);
        }
      }
    } else {
      trace!(pool_name = %self.pool_name, "Worker join handle already taken.");
    }

    match gate_result {
      Ok(()) => {
        info!(pool_name = %self.pool_name, "Pool shutdown process completed.");
        Ok(())
      }
      Err(join_error) => {
        error!(pool_name = %self.pool_name, "Gate shutdown thread failed: {:?}", join_error);
        Err(PoolError::ShutdownJoinFailed(join_error.to_string()))
      }
    }
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    gate: Arc<ShutdownGate>,
    semaphore: Arc<Semaphore>,
    consumer: QueueConsumer<R>,
    tasks_tokio_handle: TokioHandle,
    active_task_info_map: Arc<ActiveTaskMap>,
  ) {
    info!(name = %*pool_name, "Worker loop started.");

    loop {
      let permit = match semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
          error!(name = %*pool_name, "Semaphore closed. Worker loop exiting.");
          break;
        }
      };
      trace!(name = %*pool_name, "Acquired concurrency permit. Available: {}", semaphore.available_permits());

      match consumer.recv().await {
        Ok(managed_task) => Self::dispatch(
          &pool_name,
          &gate,
          &tasks_tokio_handle,
          &active_task_info_map,
          managed_task,
          permit,
        ),
        Err(_) => {
          info!(name = %*pool_name, "Task queue closed and empty.");
          break;
        }
      }
    }

    info!(
      name = %*pool_name,
      "Worker loop stopped. Tasks still running: {}",
      active_task_info_map.len()
    );
  }

  fn dispatch(
    pool_name: &Arc<String>,
    gate: &Arc<ShutdownGate>,
    tasks_tokio_handle: &TokioHandle,
    active_task_info_map: &Arc<ActiveTaskMap>,
    mut managed_task: ManagedTaskInternal<R>,
    permit: OwnedSemaphorePermit,
  ) {
    let task_id = managed_task.task_id;
    let policy = managed_task.policy;

    let guard = match gate.begin_execution(policy) {
      Some(guard) => guard,
      None => {
        debug!(name = %**pool_name, %task_id, %policy, "Dequeued task skipped by the gate.");
        managed_task.report(Err(PoolError::TaskSkipped));
        return;
      }
    };

    if managed_task.token.is_cancelled() {
      debug!(name = %**pool_name, %task_id, "Dequeued task already cancelled.");
      drop(guard);
      managed_task.report(Err(PoolError::TaskCancelled));
      return;
    }

    let ManagedTaskInternal {
      future: task_future,
      token: task_token,
      result_sender,
      ..
    } = managed_task;

    active_task_info_map.insert(task_id, (task_token.clone(), policy));
    debug!(name = %**pool_name, %task_id, %policy, "Dequeued task. Spawning with permit.");

    let active_task_info_map_cleanup = active_task_info_map.clone();
    let pool_name_for_task = pool_name.clone();

    tasks_tokio_handle.spawn(
      Self::run_task(
        pool_name_for_task,
        task_id,
        task_future,
        task_token,
        guard,
        permit,
        active_task_info_map_cleanup,
        result_sender,
      )
      .instrument(info_span!("gated_task", pool_name = %**pool_name, %task_id, %policy)),
    );
  }

  #[allow(clippy::too_many_arguments)]
  async fn run_task(
    pool_name: Arc<String>,
    task_id: u64,
    task_future: TaskToExecute<R>,
    task_token: CancellationToken,
    guard: ExecutionGuard,
    permit: OwnedSemaphorePermit,
    active_task_info_map: Arc<ActiveTaskMap>,
    result_sender: Option<oneshot::Sender<Result<R, PoolError>>>,
  ) {
    let execution_outcome: Result<R, PoolError> = tokio::select! {
      biased;
      _ = task_token.cancelled() => {
        debug!(pool_name = %*pool_name, %task_id, "Task execution cancelled by its token.");
        Err(PoolError::TaskCancelled)
      },
      task_result = AssertUnwindSafe(task_future).catch_unwind() => {
        match task_result {
          Ok(actual_result) => {
            trace!(pool_name = %*pool_name, %task_id, "Task executed successfully.");
            Ok(actual_result)
          },
          Err(_panic_payload) => {
            error!(pool_name = %*pool_name, %task_id, "Task panicked during execution.");
            Err(PoolError::TaskPanicked)
          }
        }
      }
    };

    active_task_info_map.remove(&task_id);
    // Report to the gate before the result becomes observable.
    drop(guard);
    drop(permit);

    if let Some(tx_result) = result_sender {
      if tx_result.send(execution_outcome).is_err() {
        warn!(pool_name = %*pool_name, %task_id, "Result receiver for task was dropped. Task outcome was lost.");
      }
    }
  }
}

impl<R: Send + 'static> Drop for GatedPool<R> {
  fn drop(&mut self) {
    if !self.producer.is_closed() {
      info!(
        pool_name = %*self.pool_name,
        "GatedPool dropped without shutdown. Closing task queue; the gate stays open."
      );
      self.producer.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Queue already closed.");
    }
  }
}
