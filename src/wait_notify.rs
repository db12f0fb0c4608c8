// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wait/notify coordinator: parking operations until a precondition holds.
//!
//! A service whose precondition is unmet (lock held, queue empty) returns
//! [`RunOutcome::Park`](crate::service::RunOutcome::Park) and the dispatcher
//! hands the operation here. Parked operations leave through exactly one of:
//!
//! ```text
//!                 notify(key)
//!        ┌──────────────────────────► Resume      (re-dispatched from the top)
//!        │        deadline elapsed
//!  park ─┼──────────────────────────► Expire      (service's timeout outcome)
//!        │   member left / migrated
//!        ├──────────────────────────► Invalidate  (re-dispatched, new topology)
//!        │        caller left
//!        ├──────────────────────────► Discard     (no one to answer)
//!        │        shutdown
//!        └──────────────────────────► Abort       (Shutdown failure)
//! ```
//!
//! Every transition removes the operation from its queue under one mutex, so
//! a notify racing a deadline yields exactly one outcome. The coordinator
//! never calls back into services; it returns [`WaitResolution`]s and the
//! dispatcher acts on them after the mutex is released.
//!
//! # Ordering
//!
//! Each key has a FIFO queue ordered by the sequence assigned on first park.
//! A resumed operation that parks again keeps its sequence and its original
//! deadline, so re-validation never moves it to the back of the line or
//! extends its wait.

use crate::cluster::{Address, ClusterView, MigrationInfo, PartitionId};
use crate::error::EngineError;
use crate::metrics;
use crate::operation::{Failure, Operation, WaitKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What happens to an operation leaving the coordinator.
#[derive(Debug)]
pub enum WaitResolution {
    /// Notified: run again from the top.
    Resume(Operation),
    /// Deadline passed: answer with the service's timeout outcome.
    Expire(Operation),
    /// Topology changed under it: run again from the top.
    Invalidate(Operation),
    /// Its caller left the cluster; drop without answering.
    Discard(Operation),
    /// Answer with a failure.
    Abort(Operation, Failure),
}

impl WaitResolution {
    pub fn operation(&self) -> &Operation {
        match self {
            Self::Resume(op)
            | Self::Expire(op)
            | Self::Invalidate(op)
            | Self::Discard(op)
            | Self::Abort(op, _) => op,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Resume(_) => "resumed",
            Self::Expire(_) => "expired",
            Self::Invalidate(_) => "invalidated",
            Self::Discard(_) => "discarded",
            Self::Abort(..) => "aborted",
        }
    }
}

type WaitQueue = BTreeMap<u64, Operation>;

/// Longest a single park may last; larger timeouts are clamped to it.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Parks operations per wait key and decides how they leave.
pub struct WaitNotifyCoordinator {
    this_address: Address,
    cluster: Arc<dyn ClusterView>,
    queues: Mutex<HashMap<WaitKey, WaitQueue>>,
    next_seq: AtomicU64,
}

impl WaitNotifyCoordinator {
    pub fn new(this_address: Address, cluster: Arc<dyn ClusterView>) -> Self {
        Self {
            this_address,
            cluster,
            queues: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Park `op` on `key`.
    ///
    /// A first park assigns the FIFO sequence and the deadline
    /// `now + timeout`, with `timeout` clamped to [`MAX_WAIT`]. A re-park
    /// keeps both.
    pub fn park(&self, key: WaitKey, mut op: Operation, timeout: Duration) {
        let now = Instant::now();
        let seq = *op
            .wait
            .seq
            .get_or_insert_with(|| self.next_seq.fetch_add(1, Ordering::Relaxed));
        if op.wait.deadline.is_none() {
            op.wait.deadline = Some(now + timeout.min(MAX_WAIT));
        }
        op.mark_pending();

        debug!(
            wait_key = %key,
            operation = %op,
            seq,
            remaining_ms = op.remaining_wait(now).map(|d| d.as_millis() as u64),
            "Operation parked"
        );

        let mut queues = self.queues.lock();
        queues.entry(key).or_default().insert(seq, op);
        let waiting = queues.values().map(BTreeMap::len).sum();
        drop(queues);

        metrics::record_waiting_op("parked");
        metrics::set_waiting_ops(waiting);
    }

    /// Take waiters released by a satisfying event on `key`.
    ///
    /// Waiters whose deadline already passed expire instead of resuming.
    /// Then the earliest remaining waiter (or all of them with `all`) is
    /// resumed.
    pub fn notify(&self, key: &WaitKey, all: bool) -> Vec<WaitResolution> {
        let now = Instant::now();
        let mut resolutions = Vec::new();
        {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(key) else {
                return resolutions;
            };

            let expired: Vec<u64> = queue
                .iter()
                .filter(|(_, op)| is_due(op, now))
                .map(|(seq, _)| *seq)
                .collect();
            for seq in expired {
                if let Some(op) = queue.remove(&seq) {
                    resolutions.push(WaitResolution::Expire(op));
                }
            }

            if all {
                resolutions.extend(
                    std::mem::take(queue)
                        .into_values()
                        .map(WaitResolution::Resume),
                );
            } else if let Some((_, op)) = queue.pop_first() {
                resolutions.push(WaitResolution::Resume(op));
            }

            if queue.is_empty() {
                queues.remove(key);
            }
        }
        self.record(&resolutions);
        resolutions
    }

    /// Take every waiter whose deadline is at or before `now`.
    pub fn expire_due(&self, now: Instant) -> Vec<WaitResolution> {
        let resolutions = self.drain_where(|_, op| is_due(op, now), WaitResolution::Expire);
        self.record(&resolutions);
        resolutions
    }

    /// React to a member leaving.
    ///
    /// Waiters whose caller left are discarded. Waiters on partitions this
    /// member no longer owns are invalidated so they re-run against the new
    /// owner.
    pub fn on_member_left(&self, address: &Address) -> Vec<WaitResolution> {
        let resolutions = self.drain_map(|key, op| {
            if op.caller.as_ref() == Some(address) {
                Ok(WaitResolution::Discard(op))
            } else if !self.owns(key.partition_id) {
                Ok(WaitResolution::Invalidate(op))
            } else {
                Err(op)
            }
        });
        if !resolutions.is_empty() {
            info!(
                member = %address,
                resolved = resolutions.len(),
                "Waiting operations re-evaluated after member left"
            );
        }
        self.record(&resolutions);
        resolutions
    }

    /// Invalidate waiters on a partition that migrated away from this member.
    pub fn on_partition_migrate(&self, migration: &MigrationInfo) -> Vec<WaitResolution> {
        if migration.source != self.this_address {
            return Vec::new();
        }
        let resolutions = self.drain_where(
            |key, _| key.partition_id == migration.partition_id,
            WaitResolution::Invalidate,
        );
        if !resolutions.is_empty() {
            info!(
                partition_id = migration.partition_id,
                destination = %migration.destination,
                invalidated = resolutions.len(),
                "Waiting operations invalidated by migration"
            );
        }
        self.record(&resolutions);
        resolutions
    }

    /// Abort every waiter with a `Shutdown` failure.
    pub fn shutdown(&self) -> Vec<WaitResolution> {
        let failure = EngineError::Shutdown.to_failure();
        let resolutions = self.drain_where(|_, _| true, |op| WaitResolution::Abort(op, failure.clone()));
        if !resolutions.is_empty() {
            info!(aborted = resolutions.len(), "Waiting operations aborted by shutdown");
        }
        self.record(&resolutions);
        resolutions
    }

    /// Operations currently parked.
    pub fn waiting_count(&self) -> usize {
        self.queues.lock().values().map(BTreeMap::len).sum()
    }

    /// Operations parked on one key.
    pub fn waiting_on(&self, key: &WaitKey) -> usize {
        self.queues.lock().get(key).map_or(0, BTreeMap::len)
    }

    fn owns(&self, partition_id: PartitionId) -> bool {
        self.cluster.partition_owner(partition_id).as_ref() == Some(&self.this_address)
    }

    fn drain_where<P, F>(&self, predicate: P, resolve: F) -> Vec<WaitResolution>
    where
        P: Fn(&WaitKey, &Operation) -> bool,
        F: Fn(Operation) -> WaitResolution,
    {
        self.drain_map(|key, op| {
            if predicate(key, &op) {
                Ok(resolve(op))
            } else {
                Err(op)
            }
        })
    }

    /// Visit every waiter in queue order; `Ok` removes it, `Err` keeps it.
    fn drain_map<F>(&self, mut decide: F) -> Vec<WaitResolution>
    where
        F: FnMut(&WaitKey, Operation) -> Result<WaitResolution, Operation>,
    {
        let mut resolutions = Vec::new();
        let mut queues = self.queues.lock();
        for (key, queue) in queues.iter_mut() {
            let mut kept = WaitQueue::new();
            for (seq, op) in std::mem::take(queue) {
                match decide(key, op) {
                    Ok(resolution) => resolutions.push(resolution),
                    Err(op) => {
                        kept.insert(seq, op);
                    }
                }
            }
            *queue = kept;
        }
        queues.retain(|_, queue| !queue.is_empty());
        resolutions
    }

    fn record(&self, resolutions: &[WaitResolution]) {
        if resolutions.is_empty() {
            return;
        }
        for resolution in resolutions {
            metrics::record_waiting_op(resolution.label());
        }
        metrics::set_waiting_ops(self.waiting_count());
    }
}

fn is_due(op: &Operation, now: Instant) -> bool {
    op.wait_deadline().is_some_and(|deadline| deadline <= now)
}
