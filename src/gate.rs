use crate::config::{GateConfig, ViolationMode};
use crate::diagnostics::{DiagnosticsSink, TracingSink};
use crate::policy::ShutdownPolicy;

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

/// Observable lifecycle of a [`ShutdownGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
  Active,
  ShuttingDown,
  Complete,
}

#[derive(Debug, Default)]
struct GateInner {
  shutdown_in_progress: bool,
  shutdown_complete: bool,
  /// Admitted `BlockShutdown` tasks not yet finished plus running `SkipOnShutdown` tasks.
  blocking_count: usize,
  late_blocking_posts: u32,
  late_posts_reported: bool,
}

/// Gates task admission and execution against a cooperative shutdown.
///
/// Producers call [`will_admit`](Self::will_admit) before making a task visible
/// to a queue. Executors call [`will_execute`](Self::will_execute) before running
/// a dequeued task and [`did_execute`](Self::did_execute) exactly once after it
/// ran. The owning subsystem calls [`shutdown`](Self::shutdown) once; it blocks
/// until no task whose policy requires it is still pending or running.
///
/// Every operation except `shutdown` is non-blocking and holds the internal lock
/// only for a few field updates.
pub struct ShutdownGate {
  config: GateConfig,
  inner: Mutex<GateInner>,
  shutdown_cv: Condvar,
  sink: Arc<dyn DiagnosticsSink>,
}

impl fmt::Debug for ShutdownGate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // try_lock so that Debug never blocks behind a busy gate.
    let inner = self.inner.try_lock();
    f.debug_struct("ShutdownGate")
      .field("name", &self.config.name)
      .field("late_post_cap", &self.config.late_post_cap)
      .field("state", &inner.as_ref().map(|i| Self::state_of(i)))
      .field("blocking_count", &inner.as_ref().map(|i| i.blocking_count))
      .finish_non_exhaustive()
  }
}

impl Default for ShutdownGate {
  fn default() -> Self {
    Self::new(GateConfig::default())
  }
}

impl ShutdownGate {
  /// Creates a gate that reports diagnostics through [`TracingSink`].
  pub fn new(config: GateConfig) -> Self {
    Self::with_sink(config, Arc::new(TracingSink))
  }

  pub fn with_sink(mut config: GateConfig, sink: Arc<dyn DiagnosticsSink>) -> Self {
    config.late_post_cap = config.late_post_cap.max(1);
    Self {
      config,
      inner: Mutex::new(GateInner::default()),
      shutdown_cv: Condvar::new(),
      sink,
    }
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn config(&self) -> &GateConfig {
    &self.config
  }

  /// Starts shutdown and blocks until every admitted `BlockShutdown` task and
  /// every running `SkipOnShutdown` task has finished.
  ///
  /// Must be called at most once. `ContinueOnShutdown` tasks may still be
  /// running when this returns.
  pub fn shutdown(&self) {
    let mut inner = self.inner.lock();
    if inner.shutdown_in_progress || inner.shutdown_complete {
      drop(inner);
      self.contract_violation("shutdown() called more than once");
      return;
    }

    inner.shutdown_in_progress = true;
    info!(
      gate_name = %self.config.name,
      blocking_count = inner.blocking_count,
      "Shutdown started. Waiting for blocking tasks to finish."
    );

    while inner.blocking_count != 0 {
      self.shutdown_cv.wait(&mut inner);
    }

    inner.shutdown_in_progress = false;
    inner.shutdown_complete = true;
    let pending_sample = if inner.late_posts_reported {
      None
    } else {
      inner.late_posts_reported = true;
      Some(inner.late_blocking_posts)
    };
    drop(inner);

    if let Some(count) = pending_sample {
      self.sink.record_late_block_shutdown_posts(&self.config.name, count);
    }
    info!(gate_name = %self.config.name, "Shutdown complete.");
  }

  /// Decides whether a task may be made visible to a queue.
  ///
  /// On `true` the caller must enqueue the task; on `false` it must discard it.
  pub fn will_admit(&self, policy: ShutdownPolicy) -> bool {
    self.admit(policy, true)
  }

  /// Like [`will_admit`](Self::will_admit), for callers that cannot order
  /// their posts against the end of shutdown.
  ///
  /// A `BlockShutdown` task offered after shutdown completed is rejected with
  /// `false` like any other late task instead of being treated as a protocol
  /// violation.
  pub fn try_admit(&self, policy: ShutdownPolicy) -> bool {
    self.admit(policy, false)
  }

  fn admit(&self, policy: ShutdownPolicy, late_block_is_violation: bool) -> bool {
    let mut inner = self.inner.lock();

    if inner.shutdown_complete {
      drop(inner);
      if policy == ShutdownPolicy::BlockShutdown && late_block_is_violation {
        self.contract_violation("BLOCK_SHUTDOWN task admitted after shutdown completed");
      } else {
        trace!(gate_name = %self.config.name, %policy, "Rejected admission: shutdown complete.");
      }
      return false;
    }

    match policy {
      ShutdownPolicy::BlockShutdown => {
        inner.blocking_count += 1;

        let mut sample_to_flush = None;
        if inner.shutdown_in_progress {
          let cap = self.config.late_post_cap;
          if inner.late_blocking_posts < cap {
            inner.late_blocking_posts += 1;
            if inner.late_blocking_posts == cap && !inner.late_posts_reported {
              inner.late_posts_reported = true;
              sample_to_flush = Some(cap);
            }
          }
          debug!(
            gate_name = %self.config.name,
            blocking_count = inner.blocking_count,
            "Admitted BLOCK_SHUTDOWN task during shutdown."
          );
        }
        drop(inner);

        if let Some(count) = sample_to_flush {
          self.sink.record_late_block_shutdown_posts(&self.config.name, count);
        }
        true
      }
      ShutdownPolicy::SkipOnShutdown | ShutdownPolicy::ContinueOnShutdown => {
        if inner.shutdown_in_progress {
          debug!(gate_name = %self.config.name, %policy, "Rejected admission: shutdown in progress.");
          false
        } else {
          true
        }
      }
    }
  }

  /// Decides whether an admitted task may run now.
  ///
  /// On `true` the caller must run the task and then call
  /// [`did_execute`](Self::did_execute); on `false` it must drop the task.
  pub fn will_execute(&self, policy: ShutdownPolicy) -> bool {
    let mut inner = self.inner.lock();

    if inner.shutdown_complete {
      drop(inner);
      if policy == ShutdownPolicy::BlockShutdown {
        self.contract_violation("BLOCK_SHUTDOWN task reached execution after shutdown completed");
      } else {
        trace!(gate_name = %self.config.name, %policy, "Refused execution: shutdown complete.");
      }
      return false;
    }

    match policy {
      ShutdownPolicy::BlockShutdown => {
        if inner.blocking_count == 0 {
          drop(inner);
          self.contract_violation("BLOCK_SHUTDOWN task executing without a blocking slot from admission");
        }
        true
      }
      ShutdownPolicy::SkipOnShutdown => {
        if inner.shutdown_in_progress {
          debug!(gate_name = %self.config.name, "Skipping SKIP_ON_SHUTDOWN task: shutdown in progress.");
          false
        } else {
          inner.blocking_count += 1;
          true
        }
      }
      ShutdownPolicy::ContinueOnShutdown => true,
    }
  }

  /// Bookkeeping after a task whose `will_execute` returned `true` finished,
  /// whether it completed normally or not.
  pub fn did_execute(&self, policy: ShutdownPolicy) {
    if policy.blocks_while_running() {
      self.release_blocking_slot(policy, "did_execute");
    }
  }

  /// Undoes a successful [`will_admit`](Self::will_admit) for a task the caller
  /// could not enqueue after all.
  pub fn revoke_admission(&self, policy: ShutdownPolicy) {
    if policy == ShutdownPolicy::BlockShutdown {
      self.release_blocking_slot(policy, "revoke_admission");
    }
  }

  /// Runs [`will_execute`](Self::will_execute) and, on success, returns a guard
  /// that calls [`did_execute`](Self::did_execute) when dropped, unwinding included.
  pub fn begin_execution(self: &Arc<Self>, policy: ShutdownPolicy) -> Option<ExecutionGuard> {
    if self.will_execute(policy) {
      Some(ExecutionGuard {
        gate: self.clone(),
        policy,
      })
    } else {
      None
    }
  }

  pub fn is_shutting_down(&self) -> bool {
    self.inner.lock().shutdown_in_progress
  }

  pub fn is_shutdown_complete(&self) -> bool {
    self.inner.lock().shutdown_complete
  }

  pub fn state(&self) -> GateState {
    Self::state_of(&self.inner.lock())
  }

  pub fn blocking_count(&self) -> usize {
    self.inner.lock().blocking_count
  }

  fn state_of(inner: &GateInner) -> GateState {
    if inner.shutdown_complete {
      GateState::Complete
    } else if inner.shutdown_in_progress {
      GateState::ShuttingDown
    } else {
      GateState::Active
    }
  }

  fn release_blocking_slot(&self, policy: ShutdownPolicy, operation: &str) {
    let mut inner = self.inner.lock();
    if inner.blocking_count == 0 {
      drop(inner);
      self.contract_violation(&format!("{} for {} with no blocking task outstanding", operation, policy));
      return;
    }

    inner.blocking_count -= 1;
    if inner.blocking_count == 0 && inner.shutdown_in_progress {
      trace!(gate_name = %self.config.name, "Last blocking task finished. Waking shutdown.");
      self.shutdown_cv.notify_all();
    }
  }

  fn contract_violation(&self, what: &str) {
    error!(gate_name = %self.config.name, "Shutdown protocol violation: {}", what);
    if self.config.violation_mode == ViolationMode::Panic {
      panic!("{}: shutdown protocol violation: {}", self.config.name, what);
    }
  }
}

/// Holds a running task's place in the shutdown protocol.
///
/// Dropping the guard reports completion to the gate.
#[must_use = "dropping the guard immediately marks the task as finished"]
#[derive(Debug)]
pub struct ExecutionGuard {
  gate: Arc<ShutdownGate>,
  policy: ShutdownPolicy,
}

impl ExecutionGuard {
  pub fn policy(&self) -> ShutdownPolicy {
    self.policy
  }
}

impl Drop for ExecutionGuard {
  fn drop(&mut self) {
    self.gate.did_execute(self.policy);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;
  use std::time::{Duration, Instant};

  fn test_gate(name: &str) -> Arc<ShutdownGate> {
    Arc::new(ShutdownGate::new(
      GateConfig::default()
        .with_name(name)
        .with_violation_mode(ViolationMode::Panic),
    ))
  }

  fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
      assert!(Instant::now() < deadline, "Timed out waiting for: {}", what);
      thread::sleep(Duration::from_millis(1));
    }
  }

  fn spawn_shutdown(gate: &Arc<ShutdownGate>) -> thread::JoinHandle<()> {
    let gate = gate.clone();
    thread::spawn(move || gate.shutdown())
  }

  #[test]
  fn test_block_shutdown_task_holds_shutdown_open() {
    let gate = test_gate("block_holds");
    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));

    let shutdown = spawn_shutdown(&gate);
    wait_until("shutdown to start", || gate.is_shutting_down());
    thread::sleep(Duration::from_millis(50));
    assert!(!shutdown.is_finished(), "Shutdown returned while a BLOCK_SHUTDOWN task was pending.");
    assert_eq!(gate.state(), GateState::ShuttingDown);

    assert!(gate.will_execute(ShutdownPolicy::BlockShutdown));
    gate.did_execute(ShutdownPolicy::BlockShutdown);

    shutdown.join().unwrap();
    assert_eq!(gate.state(), GateState::Complete);
    assert!(!gate.is_shutting_down());
  }

  #[test]
  fn test_skip_task_queued_before_shutdown_is_skipped() {
    let gate = test_gate("skip_queued");
    assert!(gate.will_admit(ShutdownPolicy::SkipOnShutdown));

    gate.shutdown();

    assert!(!gate.will_execute(ShutdownPolicy::SkipOnShutdown));
    assert_eq!(gate.blocking_count(), 0);
  }

  #[test]
  fn test_skip_task_running_blocks_shutdown() {
    let gate = test_gate("skip_running");
    assert!(gate.will_admit(ShutdownPolicy::SkipOnShutdown));
    assert!(gate.will_execute(ShutdownPolicy::SkipOnShutdown));

    let shutdown = spawn_shutdown(&gate);
    wait_until("shutdown to start", || gate.is_shutting_down());
    thread::sleep(Duration::from_millis(50));
    assert!(!shutdown.is_finished());

    // A second SKIP_ON_SHUTDOWN task that had not started yet is skipped.
    assert!(!gate.will_execute(ShutdownPolicy::SkipOnShutdown));

    gate.did_execute(ShutdownPolicy::SkipOnShutdown);
    shutdown.join().unwrap();
    assert!(gate.is_shutdown_complete());
  }

  #[test]
  fn test_continue_task_runs_during_shutdown_without_blocking_it() {
    let gate = test_gate("continue_runs");
    assert!(gate.will_admit(ShutdownPolicy::ContinueOnShutdown));
    // Keep shutdown in progress with an outstanding blocking task.
    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));

    let shutdown = spawn_shutdown(&gate);
    wait_until("shutdown to start", || gate.is_shutting_down());

    assert!(gate.will_execute(ShutdownPolicy::ContinueOnShutdown));
    assert_eq!(gate.blocking_count(), 1);

    assert!(gate.will_execute(ShutdownPolicy::BlockShutdown));
    gate.did_execute(ShutdownPolicy::BlockShutdown);

    // The CONTINUE_ON_SHUTDOWN task is still "running"; shutdown does not wait for it.
    shutdown.join().unwrap();
    gate.did_execute(ShutdownPolicy::ContinueOnShutdown);
    assert_eq!(gate.blocking_count(), 0);
  }

  #[test]
  fn test_nothing_admitted_or_executed_after_completion() {
    let gate = test_gate("after_complete");
    gate.shutdown();

    assert!(!gate.will_admit(ShutdownPolicy::SkipOnShutdown));
    assert!(!gate.will_admit(ShutdownPolicy::ContinueOnShutdown));
    assert!(!gate.will_execute(ShutdownPolicy::ContinueOnShutdown));
    assert!(!gate.will_execute(ShutdownPolicy::SkipOnShutdown));
  }

  #[test]
  fn test_non_blocking_admission_refused_while_shutting_down() {
    let gate = test_gate("refuse_during");
    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));
    let shutdown = spawn_shutdown(&gate);
    wait_until("shutdown to start", || gate.is_shutting_down());

    assert!(!gate.will_admit(ShutdownPolicy::SkipOnShutdown));
    assert!(!gate.will_admit(ShutdownPolicy::ContinueOnShutdown));
    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));
    assert_eq!(gate.blocking_count(), 2);

    for _ in 0..2 {
      assert!(gate.will_execute(ShutdownPolicy::BlockShutdown));
      gate.did_execute(ShutdownPolicy::BlockShutdown);
    }
    shutdown.join().unwrap();
  }

  #[test]
  fn test_full_block_sequence_leaves_count_unchanged() {
    let gate = test_gate("balanced");
    assert!(gate.will_admit(ShutdownPolicy::SkipOnShutdown));
    assert!(gate.will_execute(ShutdownPolicy::SkipOnShutdown));
    let before = gate.blocking_count();

    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));
    assert!(gate.will_execute(ShutdownPolicy::BlockShutdown));
    gate.did_execute(ShutdownPolicy::BlockShutdown);

    assert_eq!(gate.blocking_count(), before);
    gate.did_execute(ShutdownPolicy::SkipOnShutdown);
    assert_eq!(gate.blocking_count(), 0);
  }

  #[test]
  fn test_revoke_admission_releases_blocking_slot() {
    let gate = test_gate("revoke");
    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));
    assert!(gate.will_admit(ShutdownPolicy::SkipOnShutdown));
    assert_eq!(gate.blocking_count(), 1);

    gate.revoke_admission(ShutdownPolicy::SkipOnShutdown);
    assert_eq!(gate.blocking_count(), 1);
    gate.revoke_admission(ShutdownPolicy::BlockShutdown);
    assert_eq!(gate.blocking_count(), 0);

    // Nothing left to wait for.
    gate.shutdown();
  }

  #[test]
  fn test_execution_guard_reports_completion_on_panic() {
    let gate = test_gate("guard_panic");
    assert!(gate.will_admit(ShutdownPolicy::BlockShutdown));

    let gate_for_task = gate.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
      let _guard = gate_for_task.begin_execution(ShutdownPolicy::BlockShutdown).unwrap();
      panic!("task body failed");
    }));
    assert!(outcome.is_err());
    assert_eq!(gate.blocking_count(), 0);

    gate.shutdown();
    assert!(gate.is_shutdown_complete());
  }

  #[test]
  fn test_begin_execution_returns_none_for_skipped_task() {
    let gate = test_gate("guard_skip");
    assert!(gate.will_admit(ShutdownPolicy::SkipOnShutdown));
    gate.shutdown();
    assert!(gate.begin_execution(ShutdownPolicy::SkipOnShutdown).is_none());
  }

  #[test]
  fn test_try_admit_rejects_block_shutdown_after_completion() {
    let gate = test_gate("try_admit_late");
    assert!(gate.try_admit(ShutdownPolicy::BlockShutdown));
    assert!(gate.will_execute(ShutdownPolicy::BlockShutdown));
    gate.did_execute(ShutdownPolicy::BlockShutdown);
    gate.shutdown();

    for policy in ShutdownPolicy::ALL {
      assert!(!gate.try_admit(policy), "{} task admitted after completion", policy);
    }
    assert_eq!(gate.blocking_count(), 0);
  }

  #[test]
  fn test_try_admit_accepts_block_shutdown_during_shutdown() {
    let gate = test_gate("try_admit_during");
    assert!(gate.try_admit(ShutdownPolicy::BlockShutdown));
    let shutdown = spawn_shutdown(&gate);
    wait_until("shutdown to start", || gate.is_shutting_down());

    assert!(!gate.try_admit(ShutdownPolicy::SkipOnShutdown));
    assert!(gate.try_admit(ShutdownPolicy::BlockShutdown));
    assert_eq!(gate.blocking_count(), 2);

    gate.did_execute(ShutdownPolicy::BlockShutdown);
    gate.did_execute(ShutdownPolicy::BlockShutdown);
    shutdown.join().unwrap();
  }

  #[test]
  #[should_panic(expected = "BLOCK_SHUTDOWN task admitted after shutdown completed")]
  fn test_block_admission_after_completion_panics_in_panic_mode() {
    let gate = test_gate("violation_panic");
    gate.shutdown();
    gate.will_admit(ShutdownPolicy::BlockShutdown);
  }

  #[test]
  fn test_violations_are_rejected_in_log_mode() {
    let gate = ShutdownGate::new(GateConfig::default().with_violation_mode(ViolationMode::Log));
    gate.did_execute(ShutdownPolicy::BlockShutdown);
    assert_eq!(gate.blocking_count(), 0);

    gate.shutdown();
    assert!(!gate.will_admit(ShutdownPolicy::BlockShutdown));
    assert!(!gate.will_execute(ShutdownPolicy::BlockShutdown));
    // A second shutdown returns immediately.
    gate.shutdown();
    assert_eq!(gate.state(), GateState::Complete);
  }
}
