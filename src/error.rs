// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the node engine.
//!
//! Errors are categorized by where they arise (dispatch, wire, topology,
//! lifecycle) and carry enough context to log them without the caller having
//! to add any.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `WrongTarget` | Yes | Partition is not owned by the member that received the operation |
//! | `MemberLeft` | Yes | Invocation target left or disconnected before answering |
//! | `UnknownService` | No | No service registered under the operation's service name |
//! | `ProtocolViolation` | No | Packet header flags or framing are malformed |
//! | `Serialization` | No | Operation payload could not be encoded or decoded |
//! | `InvocationTimeout` | No | No response arrived within the call timeout |
//! | `Service` | No | The service's run path failed |
//! | `InvalidState` | No | Engine lifecycle violation |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Remote Failures
//!
//! A failure produced on another member travels back as a [`Failure`] and is
//! turned into the same variant here via [`Failure::into_error`], so callers
//! see identical errors whether the operation ran locally or remotely.

use crate::cluster::{Address, PartitionId};
use crate::operation::{Failure, FailureKind};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while dispatching or coordinating operations.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether a partition
/// invocation should re-resolve the owner and try again.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No service is registered under the requested name.
    ///
    /// Returned immediately and never retried.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The partition is owned by another member.
    ///
    /// Retryable: the caller re-resolves the owner and re-sends.
    #[error("Wrong target for partition {partition_id}: owner is {owner:?}")]
    WrongTarget {
        partition_id: PartitionId,
        owner: Option<Address>,
    },

    /// The invocation target left the cluster or its connection dropped.
    #[error("Member left: {address}")]
    MemberLeft { address: Address },

    /// Packet flags or framing are malformed.
    ///
    /// Fatal to the single packet only; the connection stays usable.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Encoding or decoding an operation failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No response arrived before the call timeout.
    #[error("Invocation {call_id} timed out after {timeout_ms}ms")]
    InvocationTimeout { call_id: u64, timeout_ms: u64 },

    /// The service's run path returned an error.
    #[error("Service error: {0}")]
    Service(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WrongTarget { .. } => true,
            Self::MemberLeft { .. } => true,
            Self::UnknownService(_) => false,
            Self::ProtocolViolation(_) => false,
            Self::Serialization(_) => false,
            Self::InvocationTimeout { .. } => false,
            Self::Service(_) => false,
            Self::InvalidState { .. } => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert into the wire form sent back to a remote caller.
    pub fn to_failure(&self) -> Failure {
        let kind = match self {
            Self::UnknownService(_) => FailureKind::UnknownService,
            Self::WrongTarget { .. } => FailureKind::WrongTarget,
            Self::MemberLeft { .. } => FailureKind::MemberLeft,
            Self::ProtocolViolation(_) | Self::Serialization(_) => FailureKind::Serialization,
            Self::Shutdown => FailureKind::Shutdown,
            Self::InvocationTimeout { .. }
            | Self::Service(_)
            | Self::InvalidState { .. }
            | Self::Config(_)
            | Self::Internal(_) => FailureKind::Service,
        };
        let (partition_id, owner) = match self {
            Self::WrongTarget { partition_id, owner } => (Some(*partition_id), owner.clone()),
            Self::MemberLeft { address } => (None, Some(address.clone())),
            _ => (None, None),
        };
        Failure {
            kind,
            message: self.detail(),
            partition_id,
            address: owner,
        }
    }

    /// The message without the variant prefix, so round-tripping through
    /// [`Failure`] does not stack prefixes.
    fn detail(&self) -> String {
        match self {
            Self::UnknownService(name) => name.clone(),
            Self::ProtocolViolation(msg)
            | Self::Serialization(msg)
            | Self::Service(msg)
            | Self::Config(msg)
            | Self::Internal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Failure {
    /// Turn a failure received from a remote member back into an error.
    pub fn into_error(self) -> EngineError {
        match self.kind {
            FailureKind::UnknownService => EngineError::UnknownService(self.message),
            FailureKind::WrongTarget => EngineError::WrongTarget {
                partition_id: self.partition_id.unwrap_or_default(),
                owner: self.address,
            },
            FailureKind::MemberLeft => match self.address {
                Some(address) => EngineError::MemberLeft { address },
                None => EngineError::Service(self.message),
            },
            FailureKind::Serialization => EngineError::Serialization(self.message),
            FailureKind::Shutdown => EngineError::Shutdown,
            FailureKind::Service => EngineError::Service(self.message),
        }
    }
}
