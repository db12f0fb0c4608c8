//! # Node Engine
//!
//! The per-member runtime of a partitioned in-memory data grid: it routes
//! operations to services, serializes execution per partition, parks
//! operations whose precondition is unmet, replicates state to backups and
//! keeps invocations bounded in time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                NodeEngine                                 │
//! │                                                                           │
//! │  Transport ──► handle_packet ──► ┌─────────────────────┐ ──► Service::run │
//! │                                  │ OperationDispatcher │                  │
//! │  invoke / dispatch ────────────► │ (partition locks,   │ ◄── Park/Notify  │
//! │                                  │  invocation table)  │         │        │
//! │                                  └─────────────────────┘         ▼        │
//! │         │ remote sends / backups / responses         ┌─────────────────┐  │
//! │         ▼                                            │ WaitNotify      │  │
//! │  ┌──────────────┐                                    │ Coordinator     │  │
//! │  │ RetryChannel │ ──► Connection::write              └─────────────────┘  │
//! │  │ (bounded)    │                                                         │
//! │  └──────────────┘   EventService · ProxyService · ExecutionService        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Membership and partition assignment are computed elsewhere; the engine
//! reads them through [`ClusterView`] and is told about changes through
//! [`NodeEngine::on_member_left`], [`NodeEngine::on_member_disconnect`] and
//! [`NodeEngine::on_partition_migrate`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use node_engine::{Address, EngineConfig, NodeEngine, NoOpTransport, Operation};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::for_testing(Address::new("127.0.0.1", 5701));
//!     let engine = NodeEngine::new(config, Arc::new(NoOpTransport)).expect("valid config");
//!     engine.start().await.expect("Failed to start");
//!
//!     // register services, then invoke operations against them
//!     let _ = engine
//!         .invoke_on_partition(Operation::new("my-service", "get").with_partition(3))
//!         .await;
//!
//!     engine.shutdown().await;
//! }
//! ```

pub mod async_invocation;
pub mod backup;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod execution;
pub mod metrics;
pub mod operation;
pub mod packet;
pub mod proxy;
pub mod resilience;
pub mod retry;
pub mod service;
pub mod transport;
pub mod wait_notify;

// Re-exports for convenience
pub use backup::{BackupApplier, BackupEntry, MemoryRecordStore, PartitionRecordStores, Record, RecordStore};
pub use cluster::{Address, ClusterView, MigrationInfo, PartitionId, PartitionTable};
pub use codec::{JsonCodec, OperationCodec};
pub use config::{AsyncInvocationConfig, EngineConfig, InvocationConfig, RetryChannelConfig, WaitNotifyConfig};
pub use engine::{EngineState, NodeEngine};
pub use error::{EngineError, Result};
pub use event::{Event, EventListener, EventService};
pub use operation::{Failure, FailureKind, Operation, OperationKind, Response, WaitKey};
pub use packet::Packet;
pub use proxy::{DistributedObject, ProxyService};
pub use retry::SendStatus;
pub use service::{
    BackupAware, MembershipAware, OperationContext, PostJoinAware, RemoteService, RunOutcome,
    Service,
};
pub use transport::{Connection, NoOpTransport, Transport};
