use std::fmt;

/// How a task interacts with a shutdown in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShutdownPolicy {
  /// May run during and after the start of shutdown. Never blocks shutdown.
  ContinueOnShutdown,
  /// Runs only if it starts before shutdown begins. Once started it blocks
  /// shutdown until it finishes; if not started yet, it is skipped.
  #[default]
  SkipOnShutdown,
  /// Guaranteed to run. Blocks shutdown from admission until it finishes,
  /// even when admitted after shutdown began (but never after it completed).
  BlockShutdown,
}

impl ShutdownPolicy {
  pub const ALL: [ShutdownPolicy; 3] = [
    ShutdownPolicy::ContinueOnShutdown,
    ShutdownPolicy::SkipOnShutdown,
    ShutdownPolicy::BlockShutdown,
  ];

  /// Whether a task with this policy holds a blocking slot while it runs.
  pub fn blocks_while_running(self) -> bool {
    !matches!(self, ShutdownPolicy::ContinueOnShutdown)
  }
}

impl fmt::Display for ShutdownPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ShutdownPolicy::ContinueOnShutdown => "CONTINUE_ON_SHUTDOWN",
      ShutdownPolicy::SkipOnShutdown => "SKIP_ON_SHUTDOWN",
      ShutdownPolicy::BlockShutdown => "BLOCK_SHUTDOWN",
    };
    f.write_str(s)
  }
}
