use thiserror::Error;

/// Errors surfaced by the `GatedPool` collaborator.
///
/// The `ShutdownGate` itself never fails; it only answers admission and
/// execution questions.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Task was not admitted: the gate is shutting down or already shut down")]
  TaskRejected,

  #[error("Task was admitted but skipped at execution time because of shutdown")]
  TaskSkipped,

  #[error("Task result channel error (worker dropped the task before reporting): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken or channel was not available")]
  ResultUnavailable,

  #[error("Pool's internal task queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Submitted task future panicked")]
  TaskPanicked,

  #[error("Task was cancelled")]
  TaskCancelled,

  #[error("Blocking shutdown thread failed to join: {0}")]
  ShutdownJoinFailed(String),
}
