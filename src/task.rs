use crate::error::PoolError;
use crate::policy::ShutdownPolicy;

use std::future::Future;
use std::pin::Pin;

use fibre::oneshot;
use tokio_util::sync::CancellationToken;

/// The type of future that the pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// Internal representation of a task that passed admission.
pub(crate) struct ManagedTaskInternal<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) policy: ShutdownPolicy,
  pub(crate) future: TaskToExecute<R>,
  pub(crate) token: CancellationToken,
  pub(crate) result_sender: Option<oneshot::Sender<Result<R, PoolError>>>, // Option to allow taking
}

impl<R: Send + 'static> ManagedTaskInternal<R> {
  /// Reports `outcome` to the task's handle, if anyone is still listening.
  pub(crate) fn report(&mut self, outcome: Result<R, PoolError>) -> bool {
    match self.result_sender.take() {
      Some(tx) => tx.send(outcome).is_ok(),
      None => false,
    }
  }
}
