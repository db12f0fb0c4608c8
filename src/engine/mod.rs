// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node engine.
//!
//! The per-member runtime that ties together:
//! - Service registry via [`crate::service::ServiceManager`]
//! - Operation execution and invocations via [`crate::dispatcher::OperationDispatcher`]
//! - Parked operations via [`crate::wait_notify::WaitNotifyCoordinator`]
//! - Undeliverable sends via [`crate::retry::RetryChannel`]
//! - Built-in event and proxy services
//!
//! # Lifecycle
//!
//! 1. `new()` builds every subsystem and registers the built-in services
//! 2. `start()` spawns the retry drain and wait expiry tasks
//! 3. Topology notifications (`on_member_left`, ...) arrive from outside
//! 4. `shutdown()` stops subsystems in dependency order: waiting
//!    operations, proxies, services, background tasks, async invocations,
//!    events, and finally the dispatcher

mod types;

pub use types::EngineState;

use crate::async_invocation::AsyncInvocationService;
use crate::cluster::{Address, ClusterView, MigrationInfo, PartitionTable};
use crate::codec::{JsonCodec, OperationCodec};
use crate::config::EngineConfig;
use crate::dispatcher::{DispatcherParts, OperationDispatcher};
use crate::error::{EngineError, Result};
use crate::event::EventService;
use crate::execution::ExecutionService;
use crate::metrics;
use crate::operation::{Operation, Response};
use crate::packet::Packet;
use crate::proxy::ProxyService;
use crate::retry::{RetryChannel, SendStatus};
use crate::service::{Service, ServiceManager};
use crate::transport::Transport;
use crate::wait_notify::WaitNotifyCoordinator;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// One cluster member's operation runtime.
pub struct NodeEngine {
    config: EngineConfig,

    cluster: Arc<dyn ClusterView>,

    services: Arc<ServiceManager>,

    retry: Arc<RetryChannel>,

    waits: Arc<WaitNotifyCoordinator>,

    dispatcher: Arc<OperationDispatcher>,

    events: Arc<EventService>,

    proxies: Arc<ProxyService>,

    execution: ExecutionService,

    async_invocations: AsyncInvocationService,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    state_rx: watch::Receiver<EngineState>,
}

impl NodeEngine {
    /// Create a standalone engine that owns every partition.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to spawn its background tasks.
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let table = PartitionTable::new(config.local_address.clone(), config.partition_count);
        Self::with_cluster(config, transport, Arc::new(table))
    }

    /// Create an engine over an externally maintained cluster view.
    pub fn with_cluster(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn ClusterView>,
    ) -> Result<Self> {
        Self::with_codec(config, transport, cluster, Arc::new(JsonCodec))
    }

    /// Create an engine with a custom operation codec.
    pub fn with_codec(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn ClusterView>,
        codec: Arc<dyn OperationCodec>,
    ) -> Result<Self> {
        config.validate()?;
        let this_address = config.local_address.clone();

        let retry = Arc::new(RetryChannel::new(transport, Arc::clone(&codec), &config.retry));
        let services = Arc::new(ServiceManager::new());
        let waits = Arc::new(WaitNotifyCoordinator::new(
            this_address.clone(),
            Arc::clone(&cluster),
        ));

        let events = Arc::new(EventService::new(
            this_address.clone(),
            Arc::clone(&cluster),
            Arc::clone(&retry),
        ));
        let proxies = Arc::new(ProxyService::new(
            this_address.clone(),
            Arc::clone(&cluster),
            Arc::clone(&retry),
            Arc::downgrade(&services),
        ));
        services.register(events.clone())?;
        services.register(proxies.clone())?;

        let dispatcher = Arc::new(OperationDispatcher::new(
            &config,
            DispatcherParts {
                cluster: Arc::clone(&cluster),
                services: Arc::clone(&services),
                events: Arc::clone(&events),
                codec,
                retry: Arc::clone(&retry),
                waits: Arc::clone(&waits),
            },
        ));
        let async_invocations = AsyncInvocationService::new(
            Arc::clone(&dispatcher),
            config.async_invocation.max_concurrent,
        );

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        metrics::set_engine_state("Created");
        debug!(
            address = %this_address,
            partitions = config.partition_count,
            "Node engine created"
        );

        Ok(Self {
            config,
            cluster,
            services,
            retry,
            waits,
            dispatcher,
            events,
            proxies,
            execution: ExecutionService::new(),
            async_invocations,
            state_tx,
            state_rx,
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn this_address(&self) -> &Address {
        &self.config.local_address
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterView> {
        &self.cluster
    }

    /// Start background tasks.
    ///
    /// 1. Spawns the retry channel's drain loop
    /// 2. Spawns the periodic wait-deadline scan
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(EngineError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            address = %self.config.local_address,
            services = self.services.len(),
            "Starting node engine"
        );

        if let Err(e) = self.spawn_background_tasks() {
            error!(error = %e, "Failed to start background tasks");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        self.set_state(EngineState::Running);
        info!(address = %self.config.local_address, "Node engine running");
        Ok(())
    }

    fn spawn_background_tasks(&self) -> Result<()> {
        let retry = Arc::clone(&self.retry);
        self.execution
            .execute("retry-drain", retry.run(self.execution.shutdown_signal()))?;

        let dispatcher = Arc::clone(&self.dispatcher);
        self.execution.schedule_at_fixed_rate(
            "wait-expiry",
            self.config.wait_notify.scan_interval_duration(),
            move || {
                let expired = dispatcher.expire_waiting();
                if expired > 0 {
                    trace!(expired, "Expired waiting operations");
                }
            },
        )
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Services
    // ═══════════════════════════════════════════════════════════════════════

    /// Initialize and register a service.
    pub fn register_service(&self, service: Arc<dyn Service>) -> Result<()> {
        if !self.state().is_accepting() {
            return Err(EngineError::Shutdown);
        }
        if self.services.contains(service.name()) {
            return Err(EngineError::Config(format!(
                "service '{}' is already registered",
                service.name()
            )));
        }
        service.init()?;
        self.services.register(service)
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name)
    }

    /// Registered service names in registration order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.names()
    }

    pub fn events(&self) -> &Arc<EventService> {
        &self.events
    }

    pub fn proxies(&self) -> &Arc<ProxyService> {
        &self.proxies
    }

    pub fn execution(&self) -> &ExecutionService {
        &self.execution
    }

    pub fn async_invocations(&self) -> &AsyncInvocationService {
        &self.async_invocations
    }

    /// Operations currently parked.
    pub fn waiting_operations(&self) -> usize {
        self.waits.waiting_count()
    }

    /// Sends waiting for a connection.
    pub fn pending_sends(&self) -> usize {
        self.retry.pending_count()
    }

    pub fn inflight_invocations(&self) -> usize {
        self.dispatcher.inflight_invocations()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a packet received from another member.
    pub fn handle_packet(&self, packet: Packet) {
        self.dispatcher.handle_packet(packet);
    }

    /// Execute `op` on its target without waiting for a response.
    pub fn dispatch(&self, op: Operation) -> Result<()> {
        self.dispatcher.dispatch(op)
    }

    /// Fire-and-forget send. Undeliverable sends are retried a bounded
    /// number of times and then dropped.
    pub fn send(&self, op: Operation, target: &Address) -> SendStatus {
        self.dispatcher.send(op, target)
    }

    /// Invoke `op` on `target` and wait for its response.
    pub async fn invoke(&self, op: Operation, target: Address) -> Result<Response> {
        self.dispatcher.invoke(op, target).await
    }

    /// Invoke a partition-affine operation on the partition's owner.
    pub async fn invoke_on_partition(&self, op: Operation) -> Result<Response> {
        self.dispatcher.invoke_on_partition(op).await
    }

    /// Invoke in the background and hand the outcome to `callback`.
    pub fn invoke_async<F>(&self, op: Operation, target: Option<Address>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        self.async_invocations.invoke(op, target, callback)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Post-join
    // ═══════════════════════════════════════════════════════════════════════

    /// Collect the operations a newly joined member must run, in service
    /// registration order.
    ///
    /// Partition-affine candidates are rejected: a joining member does not
    /// own partitions yet.
    pub fn post_join_operations(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        for service in self.services.services() {
            let Some(aware) = service.post_join() else {
                continue;
            };
            let Some(op) = aware.post_join_operation() else {
                continue;
            };
            if op.is_partition_aware() {
                error!(
                    service = %service.name(),
                    operation = %op,
                    "Post-join operation must not be partition-aware, skipping"
                );
                metrics::record_post_join_rejected(service.name());
                continue;
            }
            ops.push(op);
        }
        debug!(count = ops.len(), "Collected post-join operations");
        ops
    }

    /// Run post-join operations received from an existing member.
    pub fn run_post_join_operations(&self, ops: Vec<Operation>) {
        for op in ops {
            if op.is_partition_aware() {
                error!(operation = %op, "Refusing partition-aware post-join operation");
                metrics::record_post_join_rejected(&op.service_name);
                continue;
            }
            self.dispatcher.execute_local(op);
        }
    }

    /// Send this member's post-join operations to a new member. Returns
    /// how many were accepted for delivery.
    pub fn send_post_join_operations(&self, target: &Address) -> usize {
        self.post_join_operations()
            .into_iter()
            .filter(|op| self.dispatcher.send(op.clone(), target).accepted())
            .count()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Topology
    // ═══════════════════════════════════════════════════════════════════════

    /// A member left the cluster.
    ///
    /// The cluster view must already reflect the departure, so invalidated
    /// waiting operations re-run against the new partition owners.
    pub fn on_member_left(&self, address: &Address) {
        info!(member = %address, "Member left");
        metrics::record_topology_event("member_left");

        self.dispatcher.on_member_left(address);
        let resolutions = self.waits.on_member_left(address);
        self.dispatcher.process_resolutions(resolutions);
        self.events.on_member_left(address);
        for service in self.services.services() {
            if let Some(aware) = service.membership() {
                aware.member_left(address);
            }
        }
    }

    /// A member's connection dropped. It may still be a member.
    pub fn on_member_disconnect(&self, address: &Address) {
        info!(member = %address, "Member disconnected");
        metrics::record_topology_event("member_disconnect");

        self.dispatcher.on_member_disconnect(address);
        for service in self.services.services() {
            if let Some(aware) = service.membership() {
                aware.member_disconnected(address);
            }
        }
    }

    /// A partition migration completed.
    pub fn on_partition_migrate(&self, migration: &MigrationInfo) {
        metrics::record_topology_event("partition_migrate");

        self.dispatcher.on_partition_migrate(migration);
        let resolutions = self.waits.on_partition_migrate(migration);
        self.dispatcher.process_resolutions(resolutions);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shutdown
    // ═══════════════════════════════════════════════════════════════════════

    /// Shut the engine down gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Refuse new work
    /// 2. Abort parked operations with a `Shutdown` failure
    /// 3. Release proxies, shut services down (reverse registration order)
    /// 4. Stop background tasks, bounded by the drain timeout
    /// 5. Close async invocations and the event service
    /// 6. Fail invocations still waiting for a response
    pub async fn shutdown(&self) {
        if matches!(
            self.state(),
            EngineState::ShuttingDown | EngineState::Stopped
        ) {
            debug!(state = %self.state(), "Shutdown already in progress");
            return;
        }

        info!(address = %self.config.local_address, "Shutting down node engine");
        self.set_state(EngineState::ShuttingDown);
        self.dispatcher.begin_shutdown();

        let aborted = self.waits.shutdown();
        if !aborted.is_empty() {
            info!(count = aborted.len(), "Aborting waiting operations");
        }
        self.dispatcher.process_resolutions(aborted);

        self.proxies.close();
        self.services.shutdown();
        self.execution
            .shutdown(self.config.shutdown_drain_timeout_duration())
            .await;
        self.async_invocations.shutdown();
        self.events.close();
        self.dispatcher.shutdown();

        self.set_state(EngineState::Stopped);
        info!("Node engine stopped");
    }
}
