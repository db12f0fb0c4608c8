//! Configuration for the node engine.
//!
//! Configuration is passed to [`NodeEngine::new()`](crate::NodeEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use node_engine::config::EngineConfig;
//! use node_engine::Address;
//!
//! let config = EngineConfig {
//!     local_address: Address::new("10.0.0.1", 5701),
//!     partition_count: 31,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── local_address: Address             # This member
//! ├── partition_count: u32               # Logical partitions (271)
//! ├── retry: RetryChannelConfig          # Pending-send budget
//! ├── invocation: InvocationConfig       # Call timeout, partition retries
//! ├── wait_notify: WaitNotifyConfig      # Deadline scan, in-place recheck
//! ├── async_invocation: AsyncInvocationConfig
//! └── shutdown_drain_timeout: String     # "10s"
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_address: { host: "10.0.0.1", port: 5701 }
//! partition_count: 271
//!
//! retry:
//!   max_attempts: 5
//!   step: "100ms"
//!
//! invocation:
//!   call_timeout: "60s"
//!   max_retries: 10
//!
//! wait_notify:
//!   scan_interval: "100ms"
//! ```

use crate::cluster::Address;
use crate::error::{EngineError, Result};
use crate::resilience::SendRetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to NodeEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `NodeEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Address other members use to reach this one.
    pub local_address: Address,

    /// Number of logical partitions in the cluster.
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    #[serde(default)]
    pub retry: RetryChannelConfig,

    #[serde(default)]
    pub invocation: InvocationConfig,

    #[serde(default)]
    pub wait_notify: WaitNotifyConfig,

    #[serde(default)]
    pub async_invocation: AsyncInvocationConfig,

    /// How long shutdown waits for background loops to exit (e.g. "10s").
    #[serde(default = "default_shutdown_drain_timeout")]
    pub shutdown_drain_timeout: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_address: Address::new("127.0.0.1", 5701),
            partition_count: default_partition_count(),
            retry: RetryChannelConfig::default(),
            invocation: InvocationConfig::default(),
            wait_notify: WaitNotifyConfig::default(),
            async_invocation: AsyncInvocationConfig::default(),
            shutdown_drain_timeout: default_shutdown_drain_timeout(),
        }
    }
}

impl EngineConfig {
    /// Create a small config for tests: few partitions, short timeouts.
    pub fn for_testing(local_address: Address) -> Self {
        Self {
            local_address,
            partition_count: 8,
            retry: RetryChannelConfig::default(),
            invocation: InvocationConfig {
                call_timeout: "5s".to_string(),
                max_retries: 5,
                retry_pause: "10ms".to_string(),
                backup_ack_timeout: "1s".to_string(),
            },
            wait_notify: WaitNotifyConfig {
                scan_interval: "10ms".to_string(),
                in_place_recheck: false,
            },
            async_invocation: AsyncInvocationConfig { max_concurrent: 16 },
            shutdown_drain_timeout: "1s".to_string(),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(EngineError::Config(
                "partition_count must be greater than zero".to_string(),
            ));
        }
        if self.retry.step_duration().is_zero() {
            return Err(EngineError::Config(
                "retry.step must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_pending == 0 {
            return Err(EngineError::Config(
                "retry.max_pending must be greater than zero".to_string(),
            ));
        }
        if self.async_invocation.max_concurrent == 0 {
            return Err(EngineError::Config(
                "async_invocation.max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the shutdown_drain_timeout string to a Duration.
    pub fn shutdown_drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_drain_timeout).unwrap_or(Duration::from_secs(10))
    }
}

fn default_partition_count() -> u32 {
    271
}

fn default_shutdown_drain_timeout() -> String {
    "10s".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryChannelConfig: pending sends to unreachable members
// ═══════════════════════════════════════════════════════════════════════════════

/// Budget for sends whose target has no live connection yet.
///
/// Retry `n` (1-based) waits `n * step`, so the defaults give
/// 100, 200, 300, 400, 500 ms before the packet is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryChannelConfig {
    /// Connection lookups retried before the packet is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear delay increment between retries (e.g. "100ms").
    #[serde(default = "default_step")]
    pub step: String,

    /// Upper bound on queued pending sends. Sends beyond it are rejected.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_step() -> String {
    "100ms".to_string()
}

fn default_max_pending() -> usize {
    10_000
}

impl Default for RetryChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            step: default_step(),
            max_pending: default_max_pending(),
        }
    }
}

impl RetryChannelConfig {
    /// Parse the step string to a Duration.
    pub fn step_duration(&self) -> Duration {
        humantime::parse_duration(&self.step).unwrap_or(Duration::from_millis(100))
    }

    /// Build the retry schedule from these settings.
    pub fn policy(&self) -> SendRetryPolicy {
        SendRetryPolicy {
            max_attempts: self.max_attempts,
            step: self.step_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InvocationConfig: request/response calls
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for invocations that wait for a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Upper bound on how long a caller waits for a response (e.g. "60s").
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,

    /// Partition invocations retried on `WrongTarget`/`MemberLeft`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between partition invocation retries (e.g. "500ms").
    #[serde(default = "default_retry_pause")]
    pub retry_pause: String,

    /// How long to wait for sync backup acks after the primary answered.
    #[serde(default = "default_backup_ack_timeout")]
    pub backup_ack_timeout: String,
}

fn default_call_timeout() -> String {
    "60s".to_string()
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_pause() -> String {
    "500ms".to_string()
}

fn default_backup_ack_timeout() -> String {
    "5s".to_string()
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            max_retries: default_max_retries(),
            retry_pause: default_retry_pause(),
            backup_ack_timeout: default_backup_ack_timeout(),
        }
    }
}

impl InvocationConfig {
    pub fn call_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn retry_pause_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_pause).unwrap_or(Duration::from_millis(500))
    }

    pub fn backup_ack_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.backup_ack_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WaitNotifyConfig: parked operations
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitNotifyConfig {
    /// How often parked operations are checked for elapsed deadlines.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: String,

    /// Re-run notified waiters on the same partition under the lock the
    /// notifying operation already holds, instead of re-dispatching them.
    #[serde(default)]
    pub in_place_recheck: bool,
}

fn default_scan_interval() -> String {
    "100ms".to_string()
}

impl Default for WaitNotifyConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            in_place_recheck: false,
        }
    }
}

impl WaitNotifyConfig {
    /// Parse the scan_interval string to a Duration.
    pub fn scan_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.scan_interval).unwrap_or(Duration::from_millis(100))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AsyncInvocationConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncInvocationConfig {
    /// Background invocations allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    256
}

impl Default for AsyncInvocationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}
