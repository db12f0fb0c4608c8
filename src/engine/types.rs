//! Engine state types.
//!
//! Defines the state machine for the node engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown()
//!    ↓                            ↓
//!    └──────────────────→ ShuttingDown ──────→ Stopped
//!
//! Created ── start() fails ──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `NodeEngine::new()`. Operations can
//!   already be dispatched; no background tasks run yet.
//! - **Running**: Retry drain and wait expiry tasks are active.
//! - **ShuttingDown**: `shutdown()` called. New work is refused, parked
//!   operations are aborted and background tasks drain.
//! - **Stopped**: Shutdown complete. Safe to drop.
//! - **Failed**: A background task could not be started.

/// State of the node engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::NodeEngine::start) to spawn background tasks.
    Created,

    /// Running.
    ///
    /// Undeliverable sends are retried and wait deadlines enforced.
    Running,

    /// Shutting down.
    ///
    /// Subsystems are stopped in dependency order.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details.
    Failed,
}

impl EngineState {
    /// Whether the engine still accepts new work.
    pub fn is_accepting(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}
