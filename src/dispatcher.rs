// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation dispatcher.
//!
//! Routes inbound packets, executes operations against their services and
//! tracks invocations until their response arrives.
//!
//! # Execution Path
//!
//! ```text
//! handle_packet ──► route by header ──► EVENT ──► EventService
//!                        │
//!                        OP ──► decode ──┐
//! dispatch / invoke (local target) ──────┤
//!                                        ▼
//!                               ┌─── work queue ◄──────────────────┐
//!                               ▼                                  │
//!            Regular: owner check ─► partition lock ─► service.run │
//!                                         │                        │
//!                 Respond / Park / NoResponse, then notify ────────┘
//!            Backup:    partition lock ─► BackupApplier ─► ack
//!            Response:  complete invocation
//!            BackupAck: count toward the invocation's sync backups
//! ```
//!
//! Operations on one partition never run concurrently: each partition has a
//! mutex held for the whole run path. Waiters released by a notification are
//! pushed back onto the work queue and re-run after the lock is released,
//! unless `in_place_recheck` is set, in which case waiters on the same
//! partition re-run under the lock already held.
//!
//! # Invocations
//!
//! [`invoke`](OperationDispatcher::invoke) registers a call id, sends the
//! operation (or runs it inline when the target is this member) and waits
//! for the response, bounded by the call timeout. A primary that issued
//! synchronous backups reports how many; the caller then also waits for that
//! many backup acks, bounded by the backup ack timeout.

use crate::backup::{BackupApplier, BackupEntry};
use crate::cluster::{Address, ClusterView, MigrationInfo, PartitionId};
use crate::codec::{from_payload, to_payload, OperationCodec};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::EventService;
use crate::metrics;
use crate::operation::{Operation, OperationKind, Response, ResponseEnvelope};
use crate::packet::{Packet, PacketRoute};
use crate::retry::{RetryChannel, SendStatus};
use crate::service::{BackupRequest, OperationContext, RunOutcome, Service, ServiceManager};
use crate::wait_notify::{WaitNotifyCoordinator, WaitResolution};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Pending unit of work for the dispatch loop.
enum Work {
    Run(Operation),
    Resolve(WaitResolution),
}

/// An invocation awaiting its response.
struct PendingInvocation {
    target: Address,
    tx: Option<oneshot::Sender<ResponseEnvelope>>,
    acks: watch::Sender<u32>,
}

/// Removes an invocation from the registry however `invoke` exits.
struct Registered<'a> {
    invocations: &'a DashMap<u64, PendingInvocation>,
    call_id: u64,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.invocations.remove(&self.call_id);
        metrics::set_inflight_invocations(self.invocations.len());
    }
}

/// Collaborators the dispatcher is built from.
pub struct DispatcherParts {
    pub cluster: Arc<dyn ClusterView>,
    pub services: Arc<ServiceManager>,
    pub events: Arc<EventService>,
    pub codec: Arc<dyn OperationCodec>,
    pub retry: Arc<RetryChannel>,
    pub waits: Arc<WaitNotifyCoordinator>,
}

pub struct OperationDispatcher {
    this_address: Address,
    cluster: Arc<dyn ClusterView>,
    services: Arc<ServiceManager>,
    events: Arc<EventService>,
    codec: Arc<dyn OperationCodec>,
    retry: Arc<RetryChannel>,
    waits: Arc<WaitNotifyCoordinator>,
    partition_locks: Vec<Mutex<()>>,
    invocations: DashMap<u64, PendingInvocation>,
    next_call_id: AtomicU64,
    call_timeout: Duration,
    max_retries: u32,
    retry_pause: Duration,
    backup_ack_timeout: Duration,
    in_place_recheck: bool,
    accepting: AtomicBool,
}

impl OperationDispatcher {
    pub fn new(config: &EngineConfig, parts: DispatcherParts) -> Self {
        let partition_locks = (0..config.partition_count.max(1))
            .map(|_| Mutex::new(()))
            .collect();
        Self {
            this_address: config.local_address.clone(),
            cluster: parts.cluster,
            services: parts.services,
            events: parts.events,
            codec: parts.codec,
            retry: parts.retry,
            waits: parts.waits,
            partition_locks,
            invocations: DashMap::new(),
            next_call_id: AtomicU64::new(0),
            call_timeout: config.invocation.call_timeout_duration(),
            max_retries: config.invocation.max_retries,
            retry_pause: config.invocation.retry_pause_duration(),
            backup_ack_timeout: config.invocation.backup_ack_timeout_duration(),
            in_place_recheck: config.wait_notify.in_place_recheck,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn this_address(&self) -> &Address {
        &self.this_address
    }

    /// Invocations awaiting a response.
    pub fn inflight_invocations(&self) -> usize {
        self.invocations.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Route one inbound packet.
    ///
    /// Malformed packets are logged and discarded; nothing here can stop
    /// later packets from being handled.
    pub fn handle_packet(&self, packet: Packet) {
        match packet.route() {
            Ok(PacketRoute::Operation) => {
                metrics::record_packet_routed("operation");
                match self.codec.decode(packet.payload()) {
                    Ok(op) => self.drive(Work::Run(op)),
                    Err(e) => {
                        warn!(error = %e, len = packet.payload().len(), "Discarding undecodable operation packet");
                        metrics::record_protocol_violation("decode");
                    }
                }
            }
            Ok(PacketRoute::Event) => {
                metrics::record_packet_routed("event");
                self.events.handle_event_packet(&packet);
            }
            Err(e) => {
                warn!(error = %e, header = packet.header(), "Discarding packet");
                metrics::record_protocol_violation("header");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Execute `op` where its target says, without waiting for a response.
    ///
    /// A local operation addressed to an unregistered service fails here
    /// and now.
    pub fn dispatch(&self, op: Operation) -> Result<()> {
        self.ensure_accepting()?;
        match op.target.clone() {
            Some(target) if target != self.this_address => {
                if self.retry.send_operation(&op, &target).accepted() {
                    Ok(())
                } else {
                    Err(EngineError::Internal(format!("send to {target} rejected")))
                }
            }
            _ => {
                if op.kind == OperationKind::Regular && !self.services.contains(&op.service_name) {
                    metrics::record_unknown_service(&op.service_name);
                    return Err(EngineError::UnknownService(op.service_name));
                }
                self.drive(Work::Run(op));
                Ok(())
            }
        }
    }

    /// Fire-and-forget send to `target`; runs inline if `target` is this
    /// member.
    pub fn send(&self, op: Operation, target: &Address) -> SendStatus {
        if target == &self.this_address {
            self.drive(Work::Run(op));
            return SendStatus::Written;
        }
        self.retry.send_operation(&op, target)
    }

    /// Run an operation on this member, outside any invocation.
    pub fn execute_local(&self, op: Operation) {
        self.drive(Work::Run(op));
    }

    /// Invoke `op` on `target` and wait for its response.
    ///
    /// Declared failures come back as the matching [`EngineError`]; a
    /// parked operation that timed out comes back as
    /// `Ok(Response::Timeout)` (or whatever its service answers instead).
    pub async fn invoke(&self, mut op: Operation, target: Address) -> Result<Response> {
        self.ensure_accepting()?;
        if op.kind != OperationKind::Regular {
            return Err(EngineError::Internal(format!(
                "cannot invoke {:?} operation {op}",
                op.kind
            )));
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
        op.call_id = Some(call_id);
        op.caller = Some(self.this_address.clone());
        op.target = Some(target.clone());

        let (tx, rx) = oneshot::channel();
        let (acks_tx, mut acks_rx) = watch::channel(0u32);
        self.invocations.insert(
            call_id,
            PendingInvocation {
                target: target.clone(),
                tx: Some(tx),
                acks: acks_tx,
            },
        );
        metrics::set_inflight_invocations(self.invocations.len());
        let _registered = Registered {
            invocations: &self.invocations,
            call_id,
        };

        let op_wait = op.wait_timeout();
        let started = Instant::now();
        trace!(call_id, target_address = %target, operation = %op, "Invoking");

        if target == self.this_address {
            self.drive(Work::Run(op));
        } else if !self.retry.send_operation(&op, &target).accepted() {
            metrics::record_invocation("rejected", started.elapsed());
            return Err(EngineError::Internal(format!("send to {target} rejected")));
        }

        let call_timeout = self.call_timeout + op_wait.unwrap_or_default();
        let envelope = match tokio::time::timeout(call_timeout, rx).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(_)) => {
                metrics::record_invocation("shutdown", started.elapsed());
                return Err(EngineError::Shutdown);
            }
            Err(_) => {
                let timeout_ms = call_timeout.as_millis() as u64;
                warn!(call_id, target_address = %target, timeout_ms, "Invocation timed out");
                metrics::record_invocation("timeout", started.elapsed());
                return Err(EngineError::InvocationTimeout { call_id, timeout_ms });
            }
        };

        if envelope.backup_count > 0 {
            let expected = envelope.backup_count;
            let wait_acks = async {
                loop {
                    let received = *acks_rx.borrow_and_update();
                    if received >= expected {
                        break true;
                    }
                    if acks_rx.changed().await.is_err() {
                        break false;
                    }
                }
            };
            let complete = matches!(
                tokio::time::timeout(self.backup_ack_timeout, wait_acks).await,
                Ok(true)
            );
            if !complete {
                let received = *acks_rx.borrow();
                warn!(
                    call_id,
                    expected,
                    received,
                    "Backup acks missing, completing with primary response"
                );
                metrics::record_backup_ack_timeout();
            }
        }

        let outcome = match &envelope.response {
            Response::Failure(_) => "failure",
            Response::Timeout => "wait_timeout",
            Response::Ack | Response::Value(_) => "ok",
        };
        metrics::record_invocation(outcome, started.elapsed());
        envelope.response.into_result()
    }

    /// Invoke a partition-affine operation on the partition's current owner.
    ///
    /// Retryable failures (`WrongTarget`, `MemberLeft`) re-resolve the owner
    /// and try again, up to the configured retry count.
    pub async fn invoke_on_partition(&self, op: Operation) -> Result<Response> {
        let partition_id = op.partition_id.ok_or_else(|| {
            EngineError::Internal(format!("{op} has no partition to invoke on"))
        })?;

        let mut attempt = 0;
        loop {
            let result = match self.cluster.partition_owner(partition_id) {
                Some(owner) => self.invoke(op.clone(), owner).await,
                None => Err(EngineError::WrongTarget {
                    partition_id,
                    owner: None,
                }),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(partition_id, attempt, error = %e, "Retrying partition invocation");
                    metrics::record_invocation_retry(match e {
                        EngineError::WrongTarget { .. } => "wrong_target",
                        _ => "member_left",
                    });
                    tokio::time::sleep(self.retry_pause).await;
                }
                other => return other,
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Wait/notify
    // ═══════════════════════════════════════════════════════════════════════

    /// Act on operations released by the wait/notify coordinator.
    pub fn process_resolutions(&self, resolutions: Vec<WaitResolution>) {
        let mut queue: VecDeque<Work> = resolutions.into_iter().map(Work::Resolve).collect();
        self.drain(&mut queue);
    }

    /// Time out parked operations whose deadline passed. Returns how many.
    pub fn expire_waiting(&self) -> usize {
        let expired = self.waits.expire_due(Instant::now());
        let count = expired.len();
        self.process_resolutions(expired);
        count
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Topology and lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Fail invocations targeting a departed member.
    pub fn on_member_left(&self, address: &Address) {
        let failed = self.fail_invocations_to(address);
        if failed > 0 {
            info!(member = %address, failed, "Failed invocations to departed member");
        }
    }

    /// Fail invocations targeting a member whose connection dropped.
    pub fn on_member_disconnect(&self, address: &Address) {
        let failed = self.fail_invocations_to(address);
        if failed > 0 {
            info!(member = %address, failed, "Failed invocations to disconnected member");
        }
    }

    /// Migrations need no dispatcher action: a stale owner answers
    /// `WrongTarget` and partition invocations re-resolve.
    pub fn on_partition_migrate(&self, migration: &MigrationInfo) {
        debug!(
            partition_id = migration.partition_id,
            source = %migration.source,
            destination = %migration.destination,
            "Partition migrated"
        );
    }

    /// Stop accepting new dispatches and invocations.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Fail every in-flight invocation with `Shutdown`.
    pub fn shutdown(&self) {
        self.begin_shutdown();
        let failure = EngineError::Shutdown.to_failure();
        let mut failed = 0;
        for mut entry in self.invocations.iter_mut() {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(ResponseEnvelope {
                    response: Response::Failure(failure.clone()),
                    backup_count: 0,
                });
                failed += 1;
            }
        }
        info!(failed, "Operation dispatcher stopped");
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Shutdown)
        }
    }

    fn fail_invocations_to(&self, address: &Address) -> usize {
        let failure = EngineError::MemberLeft {
            address: address.clone(),
        }
        .to_failure();
        let mut failed = 0;
        for mut entry in self.invocations.iter_mut() {
            if &entry.target != address {
                continue;
            }
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(ResponseEnvelope {
                    response: Response::Failure(failure.clone()),
                    backup_count: 0,
                });
                failed += 1;
            }
        }
        failed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════════

    fn drive(&self, first: Work) {
        let mut queue = VecDeque::from([first]);
        self.drain(&mut queue);
    }

    fn drain(&self, queue: &mut VecDeque<Work>) {
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Run(op) => self.execute(op, queue),
                Work::Resolve(resolution) => self.resolve(resolution, queue),
            }
        }
    }

    fn execute(&self, op: Operation, queue: &mut VecDeque<Work>) {
        match op.kind {
            OperationKind::Regular => self.execute_regular(op, queue),
            OperationKind::Backup => self.apply_backup(op),
            OperationKind::Response => self.complete_response(op),
            OperationKind::BackupAck => self.complete_backup_ack(&op),
        }
    }

    fn resolve(&self, resolution: WaitResolution, queue: &mut VecDeque<Work>) {
        match resolution {
            WaitResolution::Resume(op) | WaitResolution::Invalidate(op) => {
                queue.push_back(Work::Run(op));
            }
            WaitResolution::Expire(op) => {
                let response = self
                    .services
                    .get(&op.service_name)
                    .map(|service| service.on_wait_expired(&op))
                    .unwrap_or(Response::Timeout);
                debug!(operation = %op, "Wait deadline elapsed");
                self.respond(op, response, 0);
            }
            WaitResolution::Discard(op) => {
                debug!(operation = %op, "Caller left, dropping waiting operation");
            }
            WaitResolution::Abort(op, failure) => {
                self.respond(op, Response::Failure(failure), 0);
            }
        }
    }

    fn execute_regular(&self, op: Operation, queue: &mut VecDeque<Work>) {
        if !self.accepting.load(Ordering::SeqCst) {
            self.respond(op, Response::Failure(EngineError::Shutdown.to_failure()), 0);
            return;
        }

        let Some(service) = self.services.get(&op.service_name) else {
            warn!(service = %op.service_name, operation = %op, "No such service");
            metrics::record_unknown_service(&op.service_name);
            let failure = EngineError::UnknownService(op.service_name.clone()).to_failure();
            self.respond(op, Response::Failure(failure), 0);
            return;
        };

        match op.partition_id {
            Some(partition_id) => {
                let owner = self.cluster.partition_owner(partition_id);
                if owner.as_ref() != Some(&self.this_address) {
                    debug!(partition_id, owner = ?owner, operation = %op, "Partition not owned here");
                    let failure = EngineError::WrongTarget {
                        partition_id,
                        owner,
                    }
                    .to_failure();
                    self.respond(op, Response::Failure(failure), 0);
                    return;
                }
                let _guard = self.partition_lock(partition_id).lock();
                self.run_locked(&service, op, queue);
            }
            None => self.run_locked(&service, op, queue),
        }
    }

    /// Run `op` with its partition lock (if any) already held.
    fn run_locked(&self, service: &Arc<dyn Service>, op: Operation, queue: &mut VecDeque<Work>) {
        let partition_id = op.partition_id;
        let (result, notifications, backups) = {
            let mut ctx = OperationContext::new(&self.this_address, &*self.cluster, &op);
            let result = service.run(&mut ctx, &op);
            let (notifications, backups) = ctx.into_parts();
            (result, notifications, backups)
        };

        let outcome = match result {
            Ok(RunOutcome::Respond(response)) => {
                let sync_backups = self.send_backups(&op, backups, true, queue);
                self.respond(op, response, sync_backups);
                "respond"
            }
            Ok(RunOutcome::NoResponse) => {
                self.send_backups(&op, backups, false, queue);
                "no_response"
            }
            Ok(RunOutcome::Park { key, timeout }) => {
                self.send_backups(&op, backups, false, queue);
                self.waits.park(key, op, timeout);
                "park"
            }
            Err(e) => {
                debug!(operation = %op, error = %e, "Operation failed");
                self.respond(op, Response::Failure(e.to_failure()), 0);
                "error"
            }
        };
        metrics::record_operation_executed(service.name(), outcome);

        for (key, all) in notifications {
            for resolution in self.waits.notify(&key, all) {
                match resolution {
                    WaitResolution::Resume(waiter)
                        if self.in_place_recheck
                            && partition_id.is_some()
                            && waiter.partition_id == partition_id =>
                    {
                        match self.services.get(&waiter.service_name) {
                            Some(waiter_service) => {
                                trace!(operation = %waiter, "Re-checking waiter under held lock");
                                self.run_locked(&waiter_service, waiter, queue);
                            }
                            None => queue.push_back(Work::Run(waiter)),
                        }
                    }
                    other => queue.push_back(Work::Resolve(other)),
                }
            }
        }
    }

    fn partition_lock(&self, partition_id: PartitionId) -> &Mutex<()> {
        &self.partition_locks[partition_id as usize % self.partition_locks.len()]
    }

    /// Send requested backups to the partition's replicas. Returns how many
    /// the caller must wait acks for.
    ///
    /// Only backups sent alongside the response are acked; backups from a
    /// run that parks or answers nothing go out fire-and-forget, so a
    /// resumed operation's ack count starts from its own backups.
    fn send_backups(
        &self,
        op: &Operation,
        requests: Vec<BackupRequest>,
        responding: bool,
        queue: &mut VecDeque<Work>,
    ) -> u32 {
        if requests.is_empty() {
            return 0;
        }
        let Some(partition_id) = op.partition_id else {
            warn!(operation = %op, "Backups requested without a partition, ignoring");
            return 0;
        };

        let mut sync_backups = 0;
        for request in requests {
            let payload = match to_payload(&request.entry) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(operation = %op, error = %e, "Failed to encode backup");
                    continue;
                }
            };
            for replica in self.cluster.backup_addresses(partition_id, request.replica_count) {
                let mut backup = Operation::new(op.service_name.clone(), "backup")
                    .with_kind(OperationKind::Backup)
                    .with_partition(partition_id)
                    .with_payload(payload.clone());
                if request.sync && responding && op.returns_response() {
                    backup.sync_ack = true;
                    backup.call_id = op.call_id;
                    backup.caller = Some(
                        op.caller
                            .clone()
                            .unwrap_or_else(|| self.this_address.clone()),
                    );
                    sync_backups += 1;
                }

                if replica == self.this_address {
                    queue.push_back(Work::Run(backup));
                } else if !self.retry.send_operation(&backup, &replica).accepted() {
                    warn!(replica = %replica, partition_id, "Backup send rejected");
                }
            }
        }
        sync_backups
    }

    fn apply_backup(&self, op: Operation) {
        let entry: BackupEntry = match from_payload(&op.payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(operation = %op, error = %e, "Discarding undecodable backup");
                return;
            }
        };
        let Some(partition_id) = op.partition_id else {
            warn!(operation = %op, "Backup without partition, discarding");
            return;
        };
        let Some(service) = self.services.get(&op.service_name) else {
            warn!(service = %op.service_name, "Backup for unknown service, discarding");
            metrics::record_unknown_service(&op.service_name);
            return;
        };
        let Some(target) = service.backup_target() else {
            warn!(service = %op.service_name, "Service does not accept backups");
            return;
        };

        {
            let _guard = self.partition_lock(partition_id).lock();
            let store = target.record_store(partition_id, &entry.store_name);
            let mut store = store.lock();
            BackupApplier::apply_entry(&mut *store, entry);
        }

        if !op.sync_ack {
            return;
        }
        let (Some(call_id), Some(caller)) = (op.call_id, op.caller.clone()) else {
            warn!(operation = %op, "Sync backup without caller, no ack sent");
            return;
        };
        let mut ack = Operation::new(op.service_name.clone(), "backup-ack")
            .with_kind(OperationKind::BackupAck)
            .with_partition(partition_id);
        ack.call_id = Some(call_id);
        if caller == self.this_address {
            self.complete_backup_ack(&ack);
        } else {
            self.retry.send_operation(&ack, &caller);
        }
    }

    /// Answer the caller of `op`, once.
    fn respond(&self, mut op: Operation, response: Response, backup_count: u32) {
        if !op.fill_response(response.clone()) {
            debug!(operation = %op, "Response already sent");
            return;
        }
        let Some(call_id) = op.call_id else {
            return;
        };

        let envelope = ResponseEnvelope {
            response,
            backup_count,
        };
        let caller = op
            .caller
            .clone()
            .unwrap_or_else(|| self.this_address.clone());
        if caller == self.this_address {
            self.complete_invocation(call_id, envelope);
            return;
        }

        let payload = match to_payload(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(call_id, error = %e, "Failed to encode response");
                return;
            }
        };
        let mut reply = Operation::new(op.service_name, "response")
            .with_kind(OperationKind::Response)
            .with_payload(payload);
        reply.call_id = Some(call_id);
        if !self.retry.send_operation(&reply, &caller).accepted() {
            warn!(call_id, caller = %caller, "Response send rejected");
        }
    }

    fn complete_response(&self, op: Operation) {
        let Some(call_id) = op.call_id else {
            warn!("Response without call id, discarding");
            return;
        };
        match from_payload::<ResponseEnvelope>(&op.payload) {
            Ok(envelope) => self.complete_invocation(call_id, envelope),
            Err(e) => warn!(call_id, error = %e, "Discarding undecodable response"),
        }
    }

    fn complete_invocation(&self, call_id: u64, envelope: ResponseEnvelope) {
        match self.invocations.get_mut(&call_id) {
            Some(mut pending) => match pending.tx.take() {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => debug!(call_id, "Duplicate response ignored"),
            },
            None => debug!(call_id, "Response for unknown or finished invocation"),
        }
    }

    fn complete_backup_ack(&self, op: &Operation) {
        let Some(call_id) = op.call_id else {
            return;
        };
        match self.invocations.get(&call_id) {
            Some(pending) => pending.acks.send_modify(|acks| *acks += 1),
            None => trace!(call_id, "Backup ack for finished invocation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{PartitionRecordStores, SharedRecordStore};
    use crate::cluster::PartitionTable;
    use crate::codec::JsonCodec;
    use crate::operation::WaitKey;
    use crate::packet::HEADER_RESPONSE;
    use crate::service::BackupAware;
    use crate::transport::NoOpTransport;
    use std::sync::atomic::AtomicUsize;

    /// Tiny lock service: "acquire" parks while held, "release" notifies.
    /// "acquire-replicated" also asks for one sync backup on every run.
    #[derive(Default)]
    struct Gate {
        held: Mutex<bool>,
        runs: AtomicUsize,
        stores: PartitionRecordStores,
    }

    impl BackupAware for Gate {
        fn record_store(&self, partition_id: PartitionId, store_name: &str) -> SharedRecordStore {
            self.stores.get_or_create(partition_id, store_name)
        }
    }

    impl Service for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn run(&self, ctx: &mut OperationContext<'_>, op: &Operation) -> Result<RunOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let key = WaitKey::new("gate", "g", op.partition_id.unwrap_or(0));
            let mut held = self.held.lock();
            if op.name == "acquire-replicated" {
                let runs = self.runs.load(Ordering::SeqCst);
                ctx.backup(
                    BackupEntry {
                        store_name: "gate".to_string(),
                        key: b"g".to_vec(),
                        value: runs.to_string().into_bytes(),
                        ttl_ms: 0,
                        unlock: false,
                    },
                    1,
                    true,
                );
            }
            match op.name.as_str() {
                "acquire" | "acquire-replicated" if *held => Ok(RunOutcome::Park {
                    key,
                    timeout: op.wait_timeout().unwrap_or(Duration::from_secs(30)),
                }),
                "acquire" | "acquire-replicated" => {
                    *held = true;
                    Ok(RunOutcome::Respond(Response::Ack))
                }
                "release" => {
                    *held = false;
                    ctx.notify(key);
                    Ok(RunOutcome::Respond(Response::Ack))
                }
                "fail" => Err(EngineError::Service("boom".to_string())),
                _ => Ok(RunOutcome::Respond(Response::value(b"?".to_vec()))),
            }
        }

        fn backup_target(&self) -> Option<&dyn BackupAware> {
            Some(self)
        }
    }

    fn here() -> Address {
        Address::new("10.0.0.1", 5701)
    }

    fn dispatcher_with(in_place: bool) -> (Arc<OperationDispatcher>, Arc<Gate>, Arc<PartitionTable>) {
        let mut config = EngineConfig::for_testing(here());
        config.wait_notify.in_place_recheck = in_place;
        let table = Arc::new(PartitionTable::new(here(), config.partition_count));
        let cluster: Arc<dyn ClusterView> = table.clone();
        let codec: Arc<dyn OperationCodec> = Arc::new(JsonCodec);
        let retry = Arc::new(RetryChannel::new(
            Arc::new(NoOpTransport),
            Arc::clone(&codec),
            &config.retry,
        ));
        let services = Arc::new(ServiceManager::new());
        let events = Arc::new(EventService::new(here(), Arc::clone(&cluster), Arc::clone(&retry)));
        let waits = Arc::new(WaitNotifyCoordinator::new(here(), Arc::clone(&cluster)));
        let gate = Arc::new(Gate::default());
        services.register(gate.clone()).unwrap();

        let dispatcher = Arc::new(OperationDispatcher::new(
            &config,
            DispatcherParts {
                cluster,
                services,
                events,
                codec,
                retry,
                waits,
            },
        ));
        (dispatcher, gate, table)
    }

    fn gate_op(name: &str) -> Operation {
        Operation::new("gate", name).with_partition(1)
    }

    #[tokio::test]
    async fn test_invoke_local_returns_response() {
        let (dispatcher, _, _) = dispatcher_with(false);
        let response = dispatcher.invoke(gate_op("acquire"), here()).await.unwrap();
        assert_eq!(response, Response::Ack);
        assert_eq!(dispatcher.inflight_invocations(), 0);
    }

    #[tokio::test]
    async fn test_unknown_service_fails_immediately() {
        let (dispatcher, _, _) = dispatcher_with(false);
        let err = dispatcher
            .invoke(Operation::new("nope", "x"), here())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownService(ref s) if s == "nope"));
        assert!(!err.is_retryable());

        assert!(matches!(
            dispatcher.dispatch(Operation::new("nope", "x")),
            Err(EngineError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_service_error_becomes_failure() {
        let (dispatcher, _, _) = dispatcher_with(false);
        let err = dispatcher.invoke(gate_op("fail"), here()).await.unwrap_err();
        assert_eq!(err.to_string(), "Service error: boom");
    }

    #[tokio::test]
    async fn test_wrong_target_when_not_owner() {
        let (dispatcher, _, table) = dispatcher_with(false);
        table.set_owner(1, Address::new("10.0.0.2", 5701));
        let err = dispatcher.invoke(gate_op("acquire"), here()).await.unwrap_err();
        assert!(matches!(err, EngineError::WrongTarget { partition_id: 1, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_park_then_release_resumes_waiter() {
        for in_place in [false, true] {
            let (dispatcher, gate, _) = dispatcher_with(in_place);
            dispatcher.invoke(gate_op("acquire"), here()).await.unwrap();

            let waiter = {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.invoke(gate_op("acquire"), here()).await })
            };
            while dispatcher.waits.waiting_count() == 0 {
                tokio::task::yield_now().await;
            }

            dispatcher.invoke(gate_op("release"), here()).await.unwrap();
            assert_eq!(waiter.await.unwrap().unwrap(), Response::Ack);
            assert!(*gate.held.lock());
            assert_eq!(dispatcher.waits.waiting_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backups_sent_while_parked_do_not_count_as_acks() {
        let (dispatcher, gate, table) = dispatcher_with(false);
        // Backups of the parked run land here and apply at once
        table.set_replicas(1, vec![here(), here()]);
        dispatcher.invoke(gate_op("acquire"), here()).await.unwrap();

        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.invoke(gate_op("acquire-replicated"), here()).await })
        };
        while dispatcher.waits.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(gate.stores.get(1, "gate").is_some());

        // The resumed run's backup goes to a member that never answers
        table.set_replicas(1, vec![here(), Address::new("10.0.0.9", 5701)]);
        let released = Instant::now();
        dispatcher.invoke(gate_op("release"), here()).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Response::Ack);
        assert!(released.elapsed() >= dispatcher.backup_ack_timeout);
        assert_eq!(dispatcher.inflight_invocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_invocation_times_out_with_timeout_outcome() {
        let (dispatcher, _, _) = dispatcher_with(false);
        dispatcher.invoke(gate_op("acquire"), here()).await.unwrap();

        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            let op = gate_op("acquire").with_wait_timeout(Duration::from_secs(30));
            tokio::spawn(async move { dispatcher.invoke(op, here()).await })
        };
        while dispatcher.waits.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(dispatcher.expire_waiting(), 1);
        assert_eq!(waiter.await.unwrap().unwrap(), Response::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_invocation_times_out() {
        let (dispatcher, _, _) = dispatcher_with(false);
        let err = dispatcher
            .invoke(gate_op("acquire"), Address::new("10.0.0.9", 5701))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvocationTimeout { timeout_ms: 5000, .. }));
        assert_eq!(dispatcher.inflight_invocations(), 0);
    }

    #[tokio::test]
    async fn test_member_left_fails_invocations_to_it() {
        let (dispatcher, _, _) = dispatcher_with(false);
        let gone = Address::new("10.0.0.9", 5701);
        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            let gone = gone.clone();
            tokio::spawn(async move { dispatcher.invoke(gate_op("acquire"), gone).await })
        };
        while dispatcher.inflight_invocations() == 0 {
            tokio::task::yield_now().await;
        }
        dispatcher.on_member_left(&gone);
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::MemberLeft { ref address } if address == &gone));
    }

    #[tokio::test]
    async fn test_inbound_response_completes_invocation() {
        let (dispatcher, _, _) = dispatcher_with(false);
        let remote = Address::new("10.0.0.9", 5701);
        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.invoke(gate_op("read"), remote).await })
        };
        while dispatcher.inflight_invocations() == 0 {
            tokio::task::yield_now().await;
        }
        let call_id = *dispatcher.invocations.iter().next().unwrap().key();

        let mut reply = Operation::new("gate", "response")
            .with_kind(OperationKind::Response)
            .with_payload(
                to_payload(&ResponseEnvelope {
                    response: Response::value(b"hi".to_vec()),
                    backup_count: 0,
                })
                .unwrap(),
            );
        reply.call_id = Some(call_id);
        let packet = Packet::operation(JsonCodec.encode(&reply).unwrap(), None)
            .with_header(HEADER_RESPONSE);
        dispatcher.handle_packet(packet);

        assert_eq!(call.await.unwrap().unwrap(), Response::value(b"hi".to_vec()));
    }

    #[tokio::test]
    async fn test_bad_packets_do_not_stop_dispatch() {
        let (dispatcher, gate, _) = dispatcher_with(false);
        dispatcher.handle_packet(Packet::new(0, None, &b"x"[..]));
        dispatcher.handle_packet(Packet::operation(&b"not an operation"[..], None));

        let op = gate_op("acquire");
        dispatcher.handle_packet(Packet::operation(JsonCodec.encode(&op).unwrap(), Some(1)));
        assert_eq!(gate.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (dispatcher, _, _) = dispatcher_with(false);
        dispatcher.shutdown();
        assert!(matches!(
            dispatcher.invoke(gate_op("acquire"), here()).await,
            Err(EngineError::Shutdown)
        ));
        assert!(matches!(
            dispatcher.dispatch(gate_op("acquire")),
            Err(EngineError::Shutdown)
        ));
    }
}
