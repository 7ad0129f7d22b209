//! Shutdown coordination for task systems.
//!
//! [`ShutdownGate`] decides whether a task may be queued, whether a queued task
//! may run, and blocks the shutdown initiator until every task whose
//! [`ShutdownPolicy`] requires it has finished. [`GatedPool`] is a Tokio-based
//! pool wired through a gate.

mod config;
mod diagnostics;
mod error;
mod gate;
mod handle;
mod policy;
mod pool;
mod task;
mod task_queue;

pub use config::{GateConfig, ViolationMode, DEFAULT_LATE_POST_CAP};
pub use diagnostics::{DiagnosticsSink, TracingSink};
pub use error::PoolError;
pub use gate::{ExecutionGuard, GateState, ShutdownGate};
pub use handle::TaskHandle;
pub use policy::ShutdownPolicy;
pub use pool::GatedPool;
pub use task::TaskToExecute;
