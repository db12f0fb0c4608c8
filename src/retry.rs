// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry channel: sends that survive short connectivity gaps.
//!
//! [`RetryChannel::send`] writes straight to a live connection when one
//! exists. Otherwise it asks the transport to connect, parks the packet as a
//! pending send and returns [`SendStatus::Queued`]. A dedicated scheduler
//! loop ([`RetryChannel::run`]) retries the lookup on a linear schedule and
//! drops the packet once the budget is spent.
//!
//! # Retry Schedule
//!
//! ```text
//! send()           miss ──► pending (retries = 0), due +100ms
//! retry 1  +100ms  miss ──► due +200ms
//! retry 2  +300ms  miss ──► due +300ms
//! retry 3  +600ms  miss ──► due +400ms
//! retry 4  +1.0s   miss ──► due +500ms
//! retry 5  +1.5s   miss ──► dropped (warn + metric)
//! ```
//!
//! Delivery is fire-and-forget: the original caller is never told about a
//! drop. Two packets queued for the same unreachable target may be written
//! in either order once it comes back.

use crate::cluster::Address;
use crate::codec::OperationCodec;
use crate::config::RetryChannelConfig;
use crate::metrics;
use crate::operation::{Operation, OperationKind};
use crate::packet::{Packet, HEADER_BACKUP_RESPONSE, HEADER_RESPONSE};
use crate::resilience::{Bulkhead, SendRetryPolicy};
use crate::transport::{Connection, Transport};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Result of handing a packet to the retry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to a live connection.
    Written,
    /// No connection yet; parked for retry.
    Queued,
    /// The transport refused the write, or the pending queue is full.
    Rejected,
}

impl SendStatus {
    /// Whether the packet was written or is still in flight.
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
        }
    }
}

/// A packet waiting for a connection to its target.
struct PendingSend {
    id: u64,
    target: Address,
    packet: Packet,
    /// Lookups retried so far. Only ever increases.
    retries: u32,
    due: Instant,
    _slot: OwnedSemaphorePermit,
}

/// Pending sends ordered by due time.
///
/// Ties are broken by insertion id so the heap never compares packets.
#[derive(Default)]
struct RetryQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, PendingSend>,
}

impl RetryQueue {
    fn push(&mut self, pending: PendingSend) {
        self.heap.push(Reverse((pending.due, pending.id)));
        self.entries.insert(pending.id, pending);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    fn drain_due(&mut self, now: Instant) -> Vec<PendingSend> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(pending) = self.entries.remove(&id) {
                due.push(pending);
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Bounded-retry packet sender.
pub struct RetryChannel {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn OperationCodec>,
    policy: SendRetryPolicy,
    slots: Bulkhead,
    queue_tx: mpsc::UnboundedSender<PendingSend>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingSend>>>,
    next_id: AtomicU64,
    pending: AtomicUsize,
}

impl RetryChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn OperationCodec>,
        config: &RetryChannelConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            codec,
            policy: config.policy(),
            slots: Bulkhead::new(config.max_pending),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            next_id: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    /// The retry schedule in use.
    pub fn policy(&self) -> &SendRetryPolicy {
        &self.policy
    }

    /// Pending sends waiting for a connection.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Send a packet to `target`.
    ///
    /// Writes immediately if a live connection exists. Otherwise the
    /// transport starts connecting and the packet is queued for retry.
    pub fn send(&self, packet: Packet, target: &Address) -> SendStatus {
        let status = match self.live_connection(target) {
            Some(conn) => {
                if conn.write(packet) {
                    SendStatus::Written
                } else {
                    debug!(target_address = %target, "Transport rejected write");
                    SendStatus::Rejected
                }
            }
            None => self.enqueue(packet, target),
        };
        metrics::record_send(status.label());
        status
    }

    /// Encode an operation and send it.
    ///
    /// Response and backup-ack operations get their informational header
    /// flags so the receiving side can tell them apart without decoding.
    pub fn send_operation(&self, op: &Operation, target: &Address) -> SendStatus {
        let bytes = match self.codec.encode(op) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(operation = %op, error = %e, "Failed to encode operation");
                metrics::record_send(SendStatus::Rejected.label());
                return SendStatus::Rejected;
            }
        };
        let mut packet = Packet::operation(bytes, op.partition_id);
        match op.kind {
            OperationKind::Response => packet = packet.with_header(HEADER_RESPONSE),
            OperationKind::BackupAck => packet = packet.with_header(HEADER_BACKUP_RESPONSE),
            OperationKind::Regular | OperationKind::Backup => {}
        }
        self.send(packet, target)
    }

    fn live_connection(&self, target: &Address) -> Option<Arc<dyn Connection>> {
        self.transport
            .resolve_or_connect(target)
            .filter(|conn| conn.is_live())
    }

    fn enqueue(&self, packet: Packet, target: &Address) -> SendStatus {
        let Some(slot) = self.slots.try_acquire() else {
            warn!(
                target_address = %target,
                max_pending = self.slots.capacity(),
                "Pending send queue full, rejecting packet"
            );
            return SendStatus::Rejected;
        };

        let pending = PendingSend {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            target: target.clone(),
            packet,
            retries: 0,
            due: Instant::now() + self.policy.delay_for_attempt(1),
            _slot: slot,
        };

        // Counted before the scheduler can see it, so its decrement never
        // runs ahead of this increment.
        let count = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.queue_tx.send(pending).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            debug!(target_address = %target, "Retry scheduler stopped, dropping packet");
            return SendStatus::Rejected;
        }
        metrics::set_pending_sends(count);
        trace!(target_address = %target, "No connection, packet queued for retry");
        SendStatus::Queued
    }

    /// Retry one pending send. Returns it back if it should be rescheduled.
    fn retry(&self, mut pending: PendingSend, now: Instant) -> Option<PendingSend> {
        pending.retries += 1;
        metrics::record_send_retry(pending.retries);

        if let Some(conn) = self.live_connection(&pending.target) {
            debug!(
                target_address = %pending.target,
                attempt = pending.retries,
                "Connection available, sending pending packet"
            );
            if !conn.write(pending.packet) {
                warn!(target_address = %pending.target, "Transport rejected pending packet");
            }
            return None;
        }

        if self.policy.allows_retry(pending.retries) {
            pending.due = now + self.policy.delay_for_attempt(pending.retries + 1);
            trace!(
                target_address = %pending.target,
                attempt = pending.retries,
                "Still no connection, rescheduling"
            );
            return Some(pending);
        }

        warn!(
            target_address = %pending.target,
            attempts = pending.retries,
            "Retry budget exhausted, dropping packet"
        );
        metrics::record_send_dropped(&pending.target.to_string());
        None
    }

    /// Run the retry scheduler until shutdown is signalled.
    ///
    /// Only the first call does anything; later calls return at once.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let Some(mut queue_rx) = self.queue_rx.lock().take() else {
            debug!("Retry scheduler already running");
            return;
        };
        let mut queue = RetryQueue::default();
        debug!("Retry scheduler started");

        loop {
            let next = queue.next_deadline();
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                received = queue_rx.recv() => match received {
                    Some(pending) => queue.push(pending),
                    None => break,
                },

                _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    let now = Instant::now();
                    for pending in queue.drain_due(now) {
                        match self.retry(pending, now) {
                            Some(again) => queue.push(again),
                            None => {
                                self.pending.fetch_sub(1, Ordering::AcqRel);
                            }
                        }
                    }
                    metrics::set_pending_sends(queue.len());
                }
            }
        }

        queue_rx.close();
        let mut abandoned = queue.len();
        while let Ok(_pending) = queue_rx.try_recv() {
            abandoned += 1;
        }
        self.pending.store(0, Ordering::Relaxed);
        metrics::set_pending_sends(0);
        info!(abandoned, "Retry scheduler stopped");
    }
}
