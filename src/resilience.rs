//! Resilience utilities: send retry schedule and bulkheads.
//!
//! - [`SendRetryPolicy`]: Linear schedule for pending sends
//! - [`Bulkhead`]: Semaphore to cap concurrent or queued work
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), node_engine::resilience::BulkheadClosed> {
//! use node_engine::resilience::{Bulkhead, SendRetryPolicy};
//! use std::time::Duration;
//!
//! let policy = SendRetryPolicy::default();
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
//!
//! let slots = Bulkhead::new(10);
//! let _permit = slots.acquire().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry schedule for sends whose target has no live connection.
///
/// # Schedule
///
/// ```text
/// Retry  Delay   Cumulative
/// -----  -----   ----------
/// 1      100ms   100ms
/// 2      200ms   300ms
/// 3      300ms   600ms
/// 4      400ms   1.0s
/// 5      500ms   1.5s     then dropped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRetryPolicy {
    /// Connection lookups retried after the first miss.
    pub max_attempts: u32,

    /// Delay added per attempt.
    pub step: Duration,
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_millis(100),
        }
    }
}

impl SendRetryPolicy {
    /// Delay before retry `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt.max(1))
    }

    /// Whether another retry is allowed after `retries` have been made.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_attempts
    }

    /// Sum of all delays in the schedule.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts).map(|a| self.delay_for_attempt(a)).sum()
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// The bulkhead was closed by shutdown while a caller waited for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bulkhead closed ({capacity} slots)")]
pub struct BulkheadClosed {
    pub capacity: usize,
}

/// Fixed pool of slots for outstanding work.
///
/// The retry channel takes slots without waiting and rejects when none are
/// left; the async invocation service waits for one. Dropping the permit
/// frees the slot.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. Fails once [`Bulkhead::close`] has been called.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                capacity: self.capacity,
            })
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held. Reads as zero after close.
    pub fn in_use(&self) -> usize {
        if self.slots.is_closed() {
            return 0;
        }
        self.capacity.saturating_sub(self.slots.available_permits())
    }

    /// Fail current waiters and every later acquire.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}
