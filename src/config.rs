/// Upper bound for the "late `BlockShutdown` posts" diagnostic counter.
pub const DEFAULT_LATE_POST_CAP: u32 = 1000;

/// What the gate does when a caller breaks the admission/execution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationMode {
  /// Log the violation and panic.
  Panic,
  /// Log the violation and reject the offending call.
  Log,
}

impl Default for ViolationMode {
  fn default() -> Self {
    if cfg!(debug_assertions) {
      ViolationMode::Panic
    } else {
      ViolationMode::Log
    }
  }
}

/// Construction parameters for a [`ShutdownGate`](crate::ShutdownGate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
  pub name: String,
  pub late_post_cap: u32,
  pub violation_mode: ViolationMode,
}

impl Default for GateConfig {
  fn default() -> Self {
    Self {
      name: "shutdown_gate".to_string(),
      late_post_cap: DEFAULT_LATE_POST_CAP,
      violation_mode: ViolationMode::default(),
    }
  }
}

impl GateConfig {
  pub fn with_name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// A cap of zero is treated as one.
  pub fn with_late_post_cap(mut self, cap: u32) -> Self {
    self.late_post_cap = cap.max(1);
    self
  }

  pub fn with_violation_mode(mut self, mode: ViolationMode) -> Self {
    self.violation_mode = mode;
    self
  }
}
