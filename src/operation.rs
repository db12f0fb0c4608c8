//! Operations, responses and wait keys.
//!
//! An [`Operation`] is a unit of work addressed to a named service. It is
//! plain data: the service interprets `name` and `payload` in its run path,
//! so operations can be encoded onto the wire and rebuilt on any member.
//!
//! The response slot is local state and never travels on the wire. It is
//! filled exactly once; a second fill is refused, which is what keeps every
//! invocation to a single terminal outcome.

use crate::cluster::{Address, PartitionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How the dispatcher treats an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Executed by the named service.
    Regular,
    /// Replicated write applied through the backup applier.
    Backup,
    /// Answer to an invocation; carries a [`ResponseEnvelope`].
    Response,
    /// Acknowledgement of a synchronous backup, sent by the backup holder
    /// straight to the original caller.
    BackupAck,
}

/// Category of a failure that crossed the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    UnknownService,
    WrongTarget,
    MemberLeft,
    Serialization,
    Shutdown,
    Service,
}

/// A declared failure, serializable so it can be returned to a remote caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub partition_id: Option<PartitionId>,
    #[serde(default)]
    pub address: Option<Address>,
}

/// Outcome of an operation as seen by its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Fixed success acknowledgement with no value.
    Ack,
    /// Success carrying an encoded value.
    Value(Vec<u8>),
    /// The operation failed.
    Failure(Failure),
    /// A parked operation's deadline elapsed before its precondition held.
    Timeout,
}

impl Response {
    pub fn value(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Value(bytes.into())
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Split declared failures off into an error, keeping value/ack/timeout.
    pub fn into_result(self) -> crate::error::Result<Response> {
        match self {
            Self::Failure(failure) => Err(failure.into_error()),
            other => Ok(other),
        }
    }
}

/// Payload of a [`OperationKind::Response`] operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response: Response,
    /// Number of synchronous backups the primary issued; the caller waits
    /// for that many [`OperationKind::BackupAck`]s.
    #[serde(default)]
    pub backup_count: u32,
}

/// Local response state of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseSlot {
    #[default]
    Empty,
    /// Parked in the wait/notify coordinator.
    Pending,
    Filled(Response),
}

/// Identifies a resource operations can wait on.
///
/// A key names exactly one (service, object, partition) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaitKey {
    pub service_name: String,
    pub object_name: String,
    pub partition_id: PartitionId,
}

impl WaitKey {
    pub fn new(
        service_name: impl Into<String>,
        object_name: impl Into<String>,
        partition_id: PartitionId,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            object_name: object_name.into(),
            partition_id,
        }
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.service_name, self.object_name, self.partition_id
        )
    }
}

/// Parking bookkeeping kept across re-parks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WaitState {
    /// Sequence assigned on first park; preserves FIFO position.
    pub seq: Option<u64>,
    /// Absolute deadline assigned on first park.
    pub deadline: Option<Instant>,
}

/// A unit of work addressed to a named service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub service_name: String,
    /// Service-defined operation name (e.g. `"lock"`, `"put"`).
    pub name: String,
    pub kind: OperationKind,
    /// Partition affinity; `None` runs outside partition locking.
    #[serde(default)]
    pub partition_id: Option<PartitionId>,
    /// Execution locality: `None` means this member.
    #[serde(default)]
    pub target: Option<Address>,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Set when a response is expected.
    #[serde(default)]
    pub call_id: Option<u64>,
    #[serde(default)]
    pub caller: Option<Address>,
    /// Backup operations only: acknowledge to the caller.
    #[serde(default)]
    pub sync_ack: bool,
    /// Blocking operations only: how long the service may park it. Extends
    /// the caller's invocation timeout by the same amount.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    #[serde(skip)]
    pub(crate) wait: WaitState,
    #[serde(skip)]
    response: ResponseSlot,
}

impl Operation {
    /// A regular operation with no partition affinity.
    pub fn new(service_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            name: name.into(),
            kind: OperationKind::Regular,
            partition_id: None,
            target: None,
            payload: Vec::new(),
            call_id: None,
            caller: None,
            sync_ack: false,
            wait_timeout_ms: None,
            wait: WaitState::default(),
            response: ResponseSlot::Empty,
        }
    }

    pub fn with_partition(mut self, partition_id: PartitionId) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_target(mut self, target: Address) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_partition_aware(&self) -> bool {
        self.partition_id.is_some()
    }

    pub fn returns_response(&self) -> bool {
        self.call_id.is_some()
    }

    pub fn response_slot(&self) -> &ResponseSlot {
        &self.response
    }

    /// Mark the operation as parked.
    pub(crate) fn mark_pending(&mut self) {
        if matches!(self.response, ResponseSlot::Empty) {
            self.response = ResponseSlot::Pending;
        }
    }

    /// Fill the response slot. Returns `false` if it was already filled.
    pub(crate) fn fill_response(&mut self, response: Response) -> bool {
        if matches!(self.response, ResponseSlot::Filled(_)) {
            return false;
        }
        self.response = ResponseSlot::Filled(response);
        true
    }

    /// Deadline assigned when the operation first parked.
    pub fn wait_deadline(&self) -> Option<Instant> {
        self.wait.deadline
    }

    /// Time left before the wait deadline, if parked before.
    pub fn remaining_wait(&self, now: Instant) -> Option<Duration> {
        self.wait
            .deadline
            .map(|d| d.saturating_duration_since(now))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.service_name, self.name)?;
        if let Some(p) = self.partition_id {
            write!(f, "@{p}")?;
        }
        if let Some(id) = self.call_id {
            write!(f, "#{id}")?;
        }
        Ok(())
    }
}
