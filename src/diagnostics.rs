use tracing::info;

/// Receives the diagnostic samples a `ShutdownGate` produces.
///
/// The gate never calls into a sink while holding its lock, so an
/// implementation may safely query the gate.
pub trait DiagnosticsSink: Send + Sync {
  /// Number of `BlockShutdown` tasks admitted after shutdown started, saturated
  /// at the gate's configured cap. Recorded once per shutdown.
  fn record_late_block_shutdown_posts(&self, gate_name: &str, count: u32);
}

impl<F> DiagnosticsSink for F
where
  F: Fn(&str, u32) + Send + Sync,
{
  fn record_late_block_shutdown_posts(&self, gate_name: &str, count: u32) {
    self(gate_name, count)
  }
}

/// Default sink: emits each sample as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
  fn record_late_block_shutdown_posts(&self, gate_name: &str, count: u32) {
    info!(%gate_name, count, "BLOCK_SHUTDOWN tasks posted during shutdown.");
  }
}
