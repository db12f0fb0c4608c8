//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory network connecting several engines
//! - A key-value test service with locks, waits and backups
//! - Cluster setup helpers

#![allow(dead_code)]

use dashmap::{DashMap, DashSet};
use node_engine::backup::{PartitionRecordStores, SharedRecordStore};
use node_engine::codec::{from_payload, to_payload};
use node_engine::{
    Address, BackupAware, BackupEntry, ClusterView, Connection, DistributedObject, EngineConfig,
    EngineError, MembershipAware, NodeEngine, Operation, OperationContext, Packet, PartitionId,
    PartitionTable, RecordStore, RemoteService, Response, Result, RunOutcome, Service, Transport,
    WaitKey,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub const PARTITIONS: u32 = 8;
pub const KV: &str = "kv";
pub const STORE: &str = "entries";

pub fn address(i: usize) -> Address {
    Address::new("10.0.0.1", 5701 + i as u16)
}

// =============================================================================
// In-memory network
// =============================================================================

/// Delivers encoded packets between engines in the same process.
///
/// Delivery is spawned, so a send never runs the receiver's dispatch on the
/// sender's stack.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: DashMap<Address, Weak<NodeEngine>>,
    down: DashSet<Address>,
    delivered: std::sync::atomic::AtomicUsize,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(NetworkTransport {
            network: Arc::clone(self),
        })
    }

    pub fn attach(&self, engine: &Arc<NodeEngine>) {
        self.nodes
            .insert(engine.this_address().clone(), Arc::downgrade(engine));
    }

    pub fn detach(&self, address: &Address) {
        self.nodes.remove(address);
    }

    /// Make `address` unreachable (or reachable again).
    pub fn set_reachable(&self, address: &Address, reachable: bool) {
        if reachable {
            self.down.remove(address);
        } else {
            self.down.insert(address.clone());
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn engine(&self, address: &Address) -> Option<Arc<NodeEngine>> {
        if self.down.contains(address) {
            return None;
        }
        self.nodes.get(address).and_then(|weak| weak.upgrade())
    }
}

struct NetworkTransport {
    network: Arc<InMemoryNetwork>,
}

impl Transport for NetworkTransport {
    fn resolve_or_connect(&self, address: &Address) -> Option<Arc<dyn Connection>> {
        self.network.engine(address)?;
        Some(Arc::new(NetworkConnection {
            network: Arc::clone(&self.network),
            target: address.clone(),
        }))
    }
}

struct NetworkConnection {
    network: Arc<InMemoryNetwork>,
    target: Address,
}

impl Connection for NetworkConnection {
    fn write(&self, packet: Packet) -> bool {
        let Some(engine) = self.network.engine(&self.target) else {
            return false;
        };
        let Ok(bytes) = packet.encode() else {
            return false;
        };
        self.network
            .delivered
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::spawn(async move {
            if let Ok(packet) = Packet::decode(&bytes) {
                engine.handle_packet(packet);
            }
        });
        true
    }

    fn is_live(&self) -> bool {
        self.network.engine(&self.target).is_some()
    }
}

// =============================================================================
// Key-value test service
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvRequest {
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub owner: String,
}

pub fn partition_for(key: &str) -> PartitionId {
    key.bytes().map(u32::from).sum::<u32>() % PARTITIONS
}

fn request_op(name: &str, request: &KvRequest) -> Operation {
    Operation::new(KV, name)
        .with_partition(partition_for(&request.key))
        .with_payload(to_payload(request).unwrap())
}

pub fn put_op(key: &str, value: &[u8]) -> Operation {
    request_op(
        "put",
        &KvRequest {
            key: key.to_string(),
            value: value.to_vec(),
            ..Default::default()
        },
    )
}

pub fn get_op(key: &str) -> Operation {
    request_op(
        "get",
        &KvRequest {
            key: key.to_string(),
            ..Default::default()
        },
    )
}

pub fn lock_op(key: &str, owner: &str, wait: Duration) -> Operation {
    request_op(
        "lock",
        &KvRequest {
            key: key.to_string(),
            owner: owner.to_string(),
            ..Default::default()
        },
    )
    .with_wait_timeout(wait)
}

pub fn unlock_op(key: &str, owner: &str) -> Operation {
    request_op(
        "unlock",
        &KvRequest {
            key: key.to_string(),
            owner: owner.to_string(),
            ..Default::default()
        },
    )
}

pub struct KvObject {
    name: String,
}

impl DistributedObject for KvObject {
    fn service_name(&self) -> &str {
        KV
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Partitioned key-value store with per-key locks.
///
/// `put` replicates synchronously to one backup; `unlock` replicates with a
/// forced unlock. `lock` parks while another owner holds the key.
#[derive(Default)]
pub struct KvService {
    pub stores: PartitionRecordStores,
    pub left: Mutex<Vec<Address>>,
    pub disconnected: Mutex<Vec<Address>>,
    pub destroyed: Mutex<Vec<String>>,
}

impl KvService {
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        let store = self.stores.get(partition_for(key), STORE)?;
        let store = store.lock();
        store.record(key.as_bytes()).map(|r| r.value.clone())
    }

    pub fn store_size(&self, key: &str) -> i64 {
        self.stores
            .get(partition_for(key), STORE)
            .map(|s| s.lock().size_estimator().size())
            .unwrap_or(0)
    }
}

impl Service for KvService {
    fn name(&self) -> &str {
        KV
    }

    fn run(&self, ctx: &mut OperationContext<'_>, op: &Operation) -> Result<RunOutcome> {
        if op.name == "echo" {
            return Ok(RunOutcome::Respond(Response::value(op.payload.clone())));
        }

        let request: KvRequest = from_payload(&op.payload)?;
        let partition_id = ctx
            .partition_id()
            .ok_or_else(|| EngineError::Service("kv operations need a partition".to_string()))?;
        let key = request.key.as_bytes();
        let store = self.stores.get_or_create(partition_id, STORE);
        let mut store = store.lock();

        match op.name.as_str() {
            "put" => {
                node_engine::BackupApplier::apply(&mut *store, key, request.value.clone(), 0, false);
                ctx.backup(
                    BackupEntry {
                        store_name: STORE.to_string(),
                        key: key.to_vec(),
                        value: request.value,
                        ttl_ms: 0,
                        unlock: false,
                    },
                    1,
                    true,
                );
                Ok(RunOutcome::Respond(Response::Ack))
            }
            "get" => Ok(RunOutcome::Respond(
                store
                    .record(key)
                    .map(|r| Response::value(r.value.clone()))
                    .unwrap_or(Response::Ack),
            )),
            "lock" => {
                if store.lock(key, &request.owner) {
                    Ok(RunOutcome::Respond(Response::Ack))
                } else {
                    Ok(RunOutcome::Park {
                        key: WaitKey::new(KV, request.key.clone(), partition_id),
                        timeout: op.wait_timeout().unwrap_or(Duration::from_secs(30)),
                    })
                }
            }
            "unlock" => {
                if !store.unlock(key, &request.owner) {
                    return Err(EngineError::Service(format!(
                        "{} does not hold {}",
                        request.owner, request.key
                    )));
                }
                ctx.notify(WaitKey::new(KV, request.key.clone(), partition_id));
                let value = store.record(key).map(|r| r.value.clone()).unwrap_or_default();
                ctx.backup(
                    BackupEntry {
                        store_name: STORE.to_string(),
                        key: key.to_vec(),
                        value,
                        ttl_ms: 0,
                        unlock: true,
                    },
                    1,
                    false,
                );
                Ok(RunOutcome::Respond(Response::Ack))
            }
            "owner" => Ok(RunOutcome::Respond(
                store
                    .lock_owner(key)
                    .map(|o| Response::value(o.as_bytes().to_vec()))
                    .unwrap_or(Response::Ack),
            )),
            other => Err(EngineError::Service(format!("unknown kv operation '{other}'"))),
        }
    }

    fn membership(&self) -> Option<&dyn MembershipAware> {
        Some(self)
    }

    fn backup_target(&self) -> Option<&dyn BackupAware> {
        Some(self)
    }

    fn remote(&self) -> Option<&dyn RemoteService> {
        Some(self)
    }
}

impl MembershipAware for KvService {
    fn member_left(&self, address: &Address) {
        self.left.lock().push(address.clone());
    }

    fn member_disconnected(&self, address: &Address) {
        self.disconnected.lock().push(address.clone());
    }
}

impl BackupAware for KvService {
    fn record_store(&self, partition_id: PartitionId, store_name: &str) -> SharedRecordStore {
        self.stores.get_or_create(partition_id, store_name)
    }
}

impl RemoteService for KvService {
    fn create_distributed_object(&self, name: &str) -> Arc<dyn DistributedObject> {
        Arc::new(KvObject {
            name: name.to_string(),
        })
    }

    fn destroy_distributed_object(&self, name: &str) {
        self.destroyed.lock().push(name.to_string());
    }
}

// =============================================================================
// Cluster setup
// =============================================================================

pub struct TestNode {
    pub engine: Arc<NodeEngine>,
    pub kv: Arc<KvService>,
}

pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub table: Arc<PartitionTable>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `size` engines sharing one partition table. Partition `p` is
    /// owned by node `p % size` and backed up on node `(p + 1) % size`.
    pub async fn start(size: usize) -> Self {
        let network = InMemoryNetwork::new();
        let table = Arc::new(PartitionTable::new(address(0), PARTITIONS));
        for i in 1..size {
            table.add_member(address(i));
        }
        for p in 0..PARTITIONS {
            let owner = p as usize % size;
            let mut replicas = vec![address(owner)];
            if size > 1 {
                replicas.push(address((owner + 1) % size));
            }
            table.set_replicas(p, replicas);
        }

        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let mut config = EngineConfig::for_testing(address(i));
            config.partition_count = PARTITIONS;
            let cluster: Arc<dyn ClusterView> = table.clone();
            let engine = Arc::new(
                NodeEngine::with_cluster(config, network.transport(), cluster).unwrap(),
            );
            let kv = Arc::new(KvService::default());
            engine.register_service(kv.clone()).unwrap();
            network.attach(&engine);
            engine.start().await.unwrap();
            nodes.push(TestNode { engine, kv });
        }

        Self {
            network,
            table,
            nodes,
        }
    }

    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    pub fn engine(&self, i: usize) -> &Arc<NodeEngine> {
        &self.nodes[i].engine
    }

    /// Index of the node owning `key`'s partition.
    pub fn owner_of(&self, key: &str) -> usize {
        let owner = self.table.partition_owner(partition_for(key)).unwrap();
        self.index_of(&owner)
    }

    pub fn backup_of(&self, key: &str) -> usize {
        let backup = self.table.backup_addresses(partition_for(key), 1);
        self.index_of(&backup[0])
    }

    pub fn index_of(&self, address: &Address) -> usize {
        self.nodes
            .iter()
            .position(|n| n.engine.this_address() == address)
            .unwrap()
    }

    /// Remove node `i` from the cluster and tell the survivors.
    pub fn kill(&self, i: usize) {
        let gone = address(i);
        self.network.detach(&gone);
        self.table.remove_member(&gone);
        for (j, node) in self.nodes.iter().enumerate() {
            if j != i {
                node.engine.on_member_left(&gone);
            }
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.engine.shutdown().await;
        }
    }
}

/// Poll `check` until it holds, yielding to spawned deliveries.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
