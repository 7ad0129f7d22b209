use crate::error::PoolError;
use crate::policy::ShutdownPolicy;
use fibre::oneshot;
use tokio_util::sync::CancellationToken;

/// A handle to a task submitted to a `GatedPool`.
///
/// Allows for requesting cancellation of the task and awaiting its result.
#[derive(Debug)]
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) policy: ShutdownPolicy,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<R, PoolError>>>,
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Returns the shutdown policy the task was submitted with.
  pub fn policy(&self) -> ShutdownPolicy {
    self.policy
  }

  /// Checks if cancellation has been requested for this task via its token.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Requests cancellation of this specific task.
  ///
  /// A cancelled task still reports to the gate as finished, so cancelling a
  /// `BlockShutdown` task releases its hold on shutdown.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, policy = %self.policy, "TaskHandle: Cancellation requested.");
    self.cancellation_token.cancel();
  }

  /// Awaits the completion of the task and returns its result of type `R`.
  ///
  /// # Errors
  /// Returns `PoolError::TaskSkipped` if shutdown prevented the task from starting.
  /// Returns `PoolError::TaskPanicked` if the task panicked during execution.
  /// Returns `PoolError::TaskCancelled` if the task was cancelled.
  /// Returns `PoolError::ResultChannelError` if the worker dropped the task without reporting.
  /// Returns `PoolError::ResultUnavailable` if `await_result` has already been called.
  pub async fn await_result(mut self) -> Result<R, PoolError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.recv().await {
        Ok(task_outcome_result) => task_outcome_result,
        Err(oneshot_recv_error) => {
          tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", oneshot_recv_error);
          Err(PoolError::ResultChannelError(format!(
            "Task (id: {}) result channel unexpectedly closed: {}",
            self.task_id, oneshot_recv_error
          )))
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }
}
