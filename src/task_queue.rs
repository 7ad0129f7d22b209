use crate::error::PoolError;
use crate::gate::ShutdownGate;
use crate::task::ManagedTaskInternal;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// An internal message type that pairs a task with the queue slot it holds.
///
/// The permit is released when this message is dropped, which happens once the
/// worker loop has received it from the channel. A queue slot is therefore only
/// freed after a task has been fully dequeued.
pub(crate) struct QueueMessage<R: Send + 'static> {
  pub(crate) task: ManagedTaskInternal<R>,
  _permit: OwnedSemaphorePermit,
}

impl<R: Send + 'static> fmt::Debug for QueueMessage<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task_id", &self.task.task_id)
      .field("policy", &self.task.policy)
      .finish_non_exhaustive()
  }
}

/// A bounded, multi-producer, single-consumer queue for admitted tasks.
///
/// Capacity is enforced by a semaphore on top of an unbounded `fibre::mpsc`
/// channel. Admission through the `ShutdownGate` happens after a slot is
/// reserved and before the task becomes visible to the consumer.
#[derive(Debug)]
pub(crate) struct TaskQueue<R: Send + 'static> {
  tx: AsyncSender<QueueMessage<R>>,
  rx: AsyncReceiver<QueueMessage<R>>,
  capacity: Arc<Semaphore>,
}

impl<R: Send + 'static> TaskQueue<R> {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      tx,
      rx,
      capacity: Arc::new(Semaphore::new(capacity.max(1))),
    }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<R>, QueueConsumer<R>) {
    (
      QueueProducer {
        tx: self.tx,
        capacity: self.capacity,
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

/// The producer half. Cloned into every submission site.
#[derive(Clone)]
pub(crate) struct QueueProducer<R: Send + 'static> {
  tx: AsyncSender<QueueMessage<R>>,
  capacity: Arc<Semaphore>,
}

/// The consumer half. Not cloneable, enforcing the single-consumer pattern.
#[derive(Debug)]
pub(crate) struct QueueConsumer<R: Send + 'static> {
  rx: AsyncReceiver<QueueMessage<R>>,
}

impl<R: Send + 'static> fmt::Debug for QueueProducer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("free_slots", &self.capacity.available_permits())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> QueueProducer<R> {
  /// Admits `task` through `gate` and enqueues it.
  ///
  /// Waits for a free slot first, so a task never sits admitted but invisible
  /// behind backpressure. If the gate refuses the task, nothing is enqueued,
  /// including a `BlockShutdown` task offered after the gate completed.
  /// If the channel turns out to be closed after admission, the admission is
  /// revoked.
  pub(crate) async fn send(&self, task: ManagedTaskInternal<R>, gate: &ShutdownGate) -> Result<(), PoolError> {
    if self.tx.is_closed() {
      return Err(PoolError::TaskRejected);
    }

    let permit = match self.capacity.clone().acquire_owned().await {
      Ok(permit) => permit,
      // The semaphore is closed together with the channel.
      Err(_) => return Err(PoolError::TaskRejected),
    };

    let policy = task.policy;
    // Submitters race the end of shutdown; a late post is an ordinary rejection here.
    if !gate.try_admit(policy) {
      return Err(PoolError::TaskRejected);
    }

    let message = QueueMessage { task, _permit: permit };
    if self.tx.send(message).await.is_ok() {
      Ok(())
    } else {
      gate.revoke_admission(policy);
      Err(PoolError::QueueSendChannelClosed)
    }
  }

  /// Closes the sending side and wakes submitters waiting for a slot.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
    self.capacity.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Returns the number of tasks in the underlying channel.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

impl<R: Send + 'static> QueueConsumer<R> {
  /// Receives a task from the queue, freeing its slot.
  pub(crate) async fn recv(&self) -> Result<ManagedTaskInternal<R>, RecvError> {
    match self.rx.recv().await {
      Ok(message) => Ok(message.task),
      Err(e) => Err(e),
    }
  }
}
