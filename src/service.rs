//! Services and the service registry.
//!
//! A [`Service`] owns some kind of data (locks, maps, queues) and runs the
//! operations addressed to it. Optional behaviour is exposed through
//! capability accessors that return `Some(self)` when implemented:
//!
//! | Capability | Used for |
//! |------------|----------|
//! | [`PostJoinAware`] | contributing an operation run on a newly joined member |
//! | [`MembershipAware`] | reacting to members leaving or disconnecting |
//! | [`BackupAware`] | exposing record stores backups are applied to |
//! | [`RemoteService`] | creating distributed-object proxies |
//!
//! Services never look up engine internals by name. Everything an operation
//! needs is passed in its [`OperationContext`], and everything it wants to
//! happen afterwards (notify waiters, replicate) is collected there too.

use crate::backup::{BackupEntry, SharedRecordStore};
use crate::cluster::{Address, ClusterView, PartitionId};
use crate::error::{EngineError, Result};
use crate::operation::{Operation, Response, WaitKey};
use crate::proxy::DistributedObject;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a service's run path decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Answer the caller.
    Respond(Response),
    /// Done; nothing to send back.
    NoResponse,
    /// Precondition unmet: park on `key` for at most `timeout`.
    Park { key: WaitKey, timeout: Duration },
}

/// Replication requested by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub entry: BackupEntry,
    /// How many backup replicas receive it.
    pub replica_count: usize,
    /// Whether the caller waits for each replica's acknowledgement.
    pub sync: bool,
}

/// Execution context handed to [`Service::run`].
pub struct OperationContext<'a> {
    this_address: &'a Address,
    cluster: &'a dyn ClusterView,
    partition_id: Option<PartitionId>,
    caller: Option<&'a Address>,
    notifications: Vec<(WaitKey, bool)>,
    backups: Vec<BackupRequest>,
}

impl<'a> OperationContext<'a> {
    pub(crate) fn new(
        this_address: &'a Address,
        cluster: &'a dyn ClusterView,
        op: &'a Operation,
    ) -> Self {
        Self {
            this_address,
            cluster,
            partition_id: op.partition_id,
            caller: op.caller.as_ref(),
            notifications: Vec::new(),
            backups: Vec::new(),
        }
    }

    pub fn this_address(&self) -> &Address {
        self.this_address
    }

    pub fn partition_id(&self) -> Option<PartitionId> {
        self.partition_id
    }

    /// Who sent the operation; `None` when it originated here.
    pub fn caller(&self) -> Option<&Address> {
        self.caller
    }

    pub fn cluster(&self) -> &dyn ClusterView {
        self.cluster
    }

    /// Wake the earliest waiter on `key` once this operation finishes.
    pub fn notify(&mut self, key: WaitKey) {
        self.notifications.push((key, false));
    }

    /// Wake every waiter on `key` once this operation finishes.
    pub fn notify_all(&mut self, key: WaitKey) {
        self.notifications.push((key, true));
    }

    /// Replicate `entry` to the partition's first `replica_count` backups.
    pub fn backup(&mut self, entry: BackupEntry, replica_count: usize, sync: bool) {
        self.backups.push(BackupRequest {
            entry,
            replica_count,
            sync,
        });
    }

    pub(crate) fn into_parts(self) -> (Vec<(WaitKey, bool)>, Vec<BackupRequest>) {
        (self.notifications, self.backups)
    }
}

/// A named, cluster-wide service.
pub trait Service: Send + Sync + 'static {
    /// Unique registry name.
    fn name(&self) -> &str;

    /// Run one operation addressed to this service.
    ///
    /// Called with the operation's partition lock held. Must not block.
    fn run(&self, ctx: &mut OperationContext<'_>, op: &Operation) -> Result<RunOutcome>;

    /// Response for a parked operation whose deadline elapsed.
    fn on_wait_expired(&self, _op: &Operation) -> Response {
        Response::Timeout
    }

    /// Called once on registration.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Called once during engine shutdown.
    fn shutdown(&self) {}

    fn post_join(&self) -> Option<&dyn PostJoinAware> {
        None
    }

    fn membership(&self) -> Option<&dyn MembershipAware> {
        None
    }

    fn backup_target(&self) -> Option<&dyn BackupAware> {
        None
    }

    fn remote(&self) -> Option<&dyn RemoteService> {
        None
    }
}

/// Contributes an operation executed on every newly joined member.
///
/// The operation must not be partition-affine; such candidates are rejected.
pub trait PostJoinAware {
    fn post_join_operation(&self) -> Option<Operation>;
}

/// Observes membership changes.
pub trait MembershipAware {
    fn member_left(&self, address: &Address);

    fn member_disconnected(&self, _address: &Address) {}
}

/// Exposes the record stores backup operations are applied to.
pub trait BackupAware {
    fn record_store(&self, partition_id: PartitionId, store_name: &str) -> SharedRecordStore;
}

/// Creates proxies for the distributed objects a service manages.
pub trait RemoteService {
    fn create_distributed_object(&self, name: &str) -> Arc<dyn DistributedObject>;

    fn destroy_distributed_object(&self, name: &str);
}

/// Name-keyed service registry that remembers registration order.
#[derive(Default)]
pub struct ServiceManager {
    services: DashMap<String, Arc<dyn Service>>,
    order: RwLock<Vec<String>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its name. Duplicate names are rejected.
    pub fn register(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = service.name().to_string();
        let mut order = self.order.write();
        match self.services.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(service = %name, "Service already registered");
                Err(EngineError::Config(format!(
                    "service '{name}' is already registered"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(service);
                order.push(name.clone());
                debug!(service = %name, position = order.len(), "Service registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// All services in registration order.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.order
            .read()
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Shut services down in reverse registration order and clear the
    /// registry.
    pub fn shutdown(&self) {
        let names: Vec<String> = std::mem::take(&mut *self.order.write());
        for name in names.iter().rev() {
            if let Some((_, service)) = self.services.remove(name) {
                debug!(service = %name, "Shutting down service");
                service.shutdown();
            }
        }
        info!(count = names.len(), "Services shut down");
    }
}
