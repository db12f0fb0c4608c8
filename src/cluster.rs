//! Cluster topology as seen by the engine.
//!
//! Membership and partition-ownership computation live outside this crate.
//! The engine only consumes:
//!
//! - a [`ClusterView`] to resolve who owns a partition and who holds its
//!   backups, and who is currently a member;
//! - "member left", "member disconnected" and "partition migrated"
//!   notifications, delivered through [`NodeEngine`](crate::NodeEngine).
//!
//! [`PartitionTable`] is a mutable in-memory `ClusterView` used by the
//! engine when no external view is supplied, and by tests to move
//! ownership around.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Logical partition number in `0..partition_count`.
pub type PartitionId = u32;

/// A routable member address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in address '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in address '{s}': {e}"))?;
        Ok(Self::new(host, port))
    }
}

/// A completed partition migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub partition_id: PartitionId,
    pub source: Address,
    pub destination: Address,
}

/// Read-only view of membership and partition ownership.
///
/// Implementations must be cheap to query; the dispatcher calls
/// [`partition_owner`](Self::partition_owner) on every partition-affine
/// operation.
pub trait ClusterView: Send + Sync + 'static {
    /// Number of logical partitions.
    fn partition_count(&self) -> u32;

    /// Current primary owner of a partition, if assigned.
    fn partition_owner(&self, partition_id: PartitionId) -> Option<Address>;

    /// Addresses of the first `count` backup replicas of a partition.
    fn backup_addresses(&self, partition_id: PartitionId, count: usize) -> Vec<Address>;

    /// Whether `address` is currently a cluster member.
    fn is_member(&self, address: &Address) -> bool;

    /// All current members, including this one.
    fn members(&self) -> Vec<Address>;
}

/// In-memory partition table.
///
/// Each partition has an ordered replica list: index 0 is the owner, the
/// rest are backups. Starts with every partition owned by the local member.
pub struct PartitionTable {
    replicas: RwLock<Vec<Vec<Address>>>,
    members: RwLock<BTreeSet<Address>>,
}

impl PartitionTable {
    /// Create a table where `local` owns all `partition_count` partitions.
    pub fn new(local: Address, partition_count: u32) -> Self {
        let replicas = (0..partition_count).map(|_| vec![local.clone()]).collect();
        let mut members = BTreeSet::new();
        members.insert(local);
        Self {
            replicas: RwLock::new(replicas),
            members: RwLock::new(members),
        }
    }

    /// Add a member.
    pub fn add_member(&self, address: Address) {
        self.members.write().insert(address);
    }

    /// Remove a member and drop it from every replica list.
    ///
    /// A partition whose owner left is promoted to its first backup, the
    /// same thing the real partition service does on member loss.
    pub fn remove_member(&self, address: &Address) {
        self.members.write().remove(address);
        for replicas in self.replicas.write().iter_mut() {
            replicas.retain(|a| a != address);
        }
    }

    /// Replace the replica list of a partition (owner first).
    pub fn set_replicas(&self, partition_id: PartitionId, replicas: Vec<Address>) {
        let mut table = self.replicas.write();
        if let Some(slot) = table.get_mut(partition_id as usize) {
            *slot = replicas;
        }
    }

    /// Make `owner` the primary of a partition, keeping existing backups.
    pub fn set_owner(&self, partition_id: PartitionId, owner: Address) {
        let mut table = self.replicas.write();
        if let Some(slot) = table.get_mut(partition_id as usize) {
            slot.retain(|a| a != &owner);
            slot.insert(0, owner);
        }
    }

    /// Apply a migration: the destination becomes the owner.
    pub fn apply_migration(&self, migration: &MigrationInfo) {
        self.set_owner(migration.partition_id, migration.destination.clone());
    }
}

impl ClusterView for PartitionTable {
    fn partition_count(&self) -> u32 {
        self.replicas.read().len() as u32
    }

    fn partition_owner(&self, partition_id: PartitionId) -> Option<Address> {
        self.replicas
            .read()
            .get(partition_id as usize)
            .and_then(|r| r.first().cloned())
    }

    fn backup_addresses(&self, partition_id: PartitionId, count: usize) -> Vec<Address> {
        self.replicas
            .read()
            .get(partition_id as usize)
            .map(|r| r.iter().skip(1).take(count).cloned().collect())
            .unwrap_or_default()
    }

    fn is_member(&self, address: &Address) -> bool {
        self.members.read().contains(address)
    }

    fn members(&self) -> Vec<Address> {
        self.members.read().iter().cloned().collect()
    }
}
