//! Backup application on replica holders.
//!
//! A primary that mutates a record asks its backup replicas to apply the
//! same write. The replica side goes through [`BackupApplier::apply`], which
//! creates or overwrites the local copy and keeps the store's
//! [`SizeEstimator`] exact by bracketing every mutation with a
//! subtract-then-add of the record's cost.
//!
//! # Forced Unlock
//!
//! A backup may carry `unlock = true`. The primary already checked lock
//! ownership, so the replica releases the lock on the key without an owner
//! check. This is the only place in the crate that bypasses lock ownership,
//! and every such release is logged with `audit = "forced_unlock"`.

use crate::cluster::PartitionId;
use crate::metrics;
use crate::operation::Response;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Locally held replica of a data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Vec<u8>,
    /// Time-to-live in milliseconds; zero means no expiry.
    pub ttl_ms: u64,
    /// Bumped on every overwrite.
    pub version: u64,
}

impl Record {
    pub fn new(value: Vec<u8>, ttl_ms: u64) -> Self {
        Self {
            value,
            ttl_ms,
            version: 0,
        }
    }
}

/// Running estimate of a record store's memory cost.
///
/// Only ever moved by signed deltas; never recomputed from scratch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SizeEstimator {
    size: i64,
}

impl SizeEstimator {
    pub fn add(&mut self, delta: i64) {
        self.size += delta;
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Estimated cost of one record.
    pub fn cost(record: &Record) -> i64 {
        record.value.len() as i64
    }
}

/// A partition-local container of records.
///
/// Implemented by data-structure services; the engine only needs record
/// lookup, insertion, the size estimator and the forced unlock hook.
pub trait RecordStore: Send {
    fn name(&self) -> &str;

    fn record(&self, key: &[u8]) -> Option<&Record>;

    fn record_mut(&mut self, key: &[u8]) -> Option<&mut Record>;

    fn put_record(&mut self, key: Vec<u8>, record: Record);

    fn size_estimator(&self) -> &SizeEstimator;

    fn size_estimator_mut(&mut self) -> &mut SizeEstimator;

    /// Release any lock on `key` regardless of owner. Returns whether a lock
    /// was held.
    fn force_unlock(&mut self, key: &[u8]) -> bool;
}

/// Hash-map record store with a per-key lock table.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    name: String,
    records: HashMap<Vec<u8>, Record>,
    /// Key -> lock-owner token.
    locks: HashMap<Vec<u8>, String>,
    estimator: SizeEstimator,
}

impl MemoryRecordStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Acquire the lock on `key` for `owner`. Re-entrant for the same owner.
    pub fn lock(&mut self, key: &[u8], owner: &str) -> bool {
        match self.locks.get(key) {
            Some(current) => current == owner,
            None => {
                self.locks.insert(key.to_vec(), owner.to_string());
                true
            }
        }
    }

    /// Release the lock on `key` if `owner` holds it.
    pub fn unlock(&mut self, key: &[u8], owner: &str) -> bool {
        if self.locks.get(key).map(String::as_str) == Some(owner) {
            self.locks.remove(key);
            true
        } else {
            false
        }
    }

    pub fn lock_owner(&self, key: &[u8]) -> Option<&str> {
        self.locks.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cost of every record computed from scratch, for cross-checking the
    /// incremental estimator.
    pub fn recomputed_size(&self) -> i64 {
        self.records.values().map(SizeEstimator::cost).sum()
    }
}

impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn record(&self, key: &[u8]) -> Option<&Record> {
        self.records.get(key)
    }

    fn record_mut(&mut self, key: &[u8]) -> Option<&mut Record> {
        self.records.get_mut(key)
    }

    fn put_record(&mut self, key: Vec<u8>, record: Record) {
        self.records.insert(key, record);
    }

    fn size_estimator(&self) -> &SizeEstimator {
        &self.estimator
    }

    fn size_estimator_mut(&mut self) -> &mut SizeEstimator {
        &mut self.estimator
    }

    fn force_unlock(&mut self, key: &[u8]) -> bool {
        self.locks.remove(key).is_some()
    }
}

/// Shared handle to a record store.
pub type SharedRecordStore = Arc<Mutex<dyn RecordStore>>;

/// Record stores of one service, keyed by (partition, store name).
///
/// Each store is only ever touched under its partition's lock, so the inner
/// mutex is uncontended.
#[derive(Default)]
pub struct PartitionRecordStores {
    stores: DashMap<(PartitionId, String), Arc<Mutex<MemoryRecordStore>>>,
}

impl PartitionRecordStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the store for a partition.
    pub fn get_or_create(&self, partition_id: PartitionId, name: &str) -> Arc<Mutex<MemoryRecordStore>> {
        self.stores
            .entry((partition_id, name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(MemoryRecordStore::new(name))))
            .clone()
    }

    pub fn get(&self, partition_id: PartitionId, name: &str) -> Option<Arc<Mutex<MemoryRecordStore>>> {
        self.stores
            .get(&(partition_id, name.to_string()))
            .map(|s| s.clone())
    }

    /// Drop every store of a partition (e.g. after migrating it away).
    pub fn clear_partition(&self, partition_id: PartitionId) {
        self.stores.retain(|(p, _), _| *p != partition_id);
    }
}

/// Replicated write carried by a backup operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub store_name: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    #[serde(default)]
    pub ttl_ms: u64,
    /// Release the key's lock after applying.
    #[serde(default)]
    pub unlock: bool,
}

/// Applies backup writes to a record store.
pub struct BackupApplier;

impl BackupApplier {
    /// Create or overwrite the record for `key`.
    ///
    /// A new record adds its cost to the estimator. An existing one has its
    /// current cost subtracted before the value is replaced and the new cost
    /// added after, so the estimator nets to the true size whichever way the
    /// value changed. The TTL is only set on creation.
    ///
    /// Always answers [`Response::Ack`].
    pub fn apply(
        store: &mut dyn RecordStore,
        key: &[u8],
        value: Vec<u8>,
        ttl_ms: u64,
        unlock: bool,
    ) -> Response {
        let created = match store.record(key).map(SizeEstimator::cost) {
            None => {
                let record = Record::new(value, ttl_ms);
                let cost = SizeEstimator::cost(&record);
                store.size_estimator_mut().add(cost);
                store.put_record(key.to_vec(), record);
                true
            }
            Some(old_cost) => {
                store.size_estimator_mut().add(-old_cost);
                let new_cost = match store.record_mut(key) {
                    Some(record) => {
                        record.value = value;
                        record.version += 1;
                        SizeEstimator::cost(record)
                    }
                    None => 0,
                };
                store.size_estimator_mut().add(new_cost);
                false
            }
        };

        debug!(
            store = %store.name(),
            created,
            size = store.size_estimator().size(),
            "Backup applied"
        );
        metrics::record_backup_applied(store.name(), created);
        metrics::set_record_store_size(store.name(), store.size_estimator().size());

        if unlock && store.force_unlock(key) {
            info!(
                audit = "forced_unlock",
                store = %store.name(),
                key_len = key.len(),
                "Lock released by backup without owner check"
            );
            metrics::record_forced_unlock(store.name());
        }

        Response::Ack
    }

    /// Apply a decoded [`BackupEntry`].
    pub fn apply_entry(store: &mut dyn RecordStore, entry: BackupEntry) -> Response {
        Self::apply(store, &entry.key, entry.value, entry.ttl_ms, entry.unlock)
    }
}
