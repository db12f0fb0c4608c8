// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the node engine.
//!
//! Several engines share one partition table and talk over an in-memory
//! network, so these run without any external infrastructure.
//!
//! # Test Organization
//! - `locality_*` - same outcome whether an operation runs here or remotely
//! - `wait_*` - parking, notification, deadlines
//! - `topology_*` - member loss, disconnects, migrations
//! - `backup_*` - replication and sync acks
//! - `post_join_*`, `event_*`, `proxy_*` - built-in services

mod common;

use common::*;
use node_engine::{
    EngineError, Event, EventListener, MigrationInfo, Operation, RecordStore, Response,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// First generated key whose partition is owned by node `owner`.
fn key_owned_by(cluster: &TestCluster, owner: usize) -> String {
    (0..)
        .map(|i| format!("key-{i}"))
        .find(|k| cluster.owner_of(k) == owner)
        .unwrap()
}

// =============================================================================
// Locality
// =============================================================================

#[tokio::test]
async fn locality_local_and_remote_values_match() {
    let cluster = TestCluster::start(2).await;
    let local_key = key_owned_by(&cluster, 0);
    let remote_key = key_owned_by(&cluster, 1);

    for key in [&local_key, &remote_key] {
        let put = cluster
            .engine(0)
            .invoke_on_partition(put_op(key, b"v1"))
            .await
            .unwrap();
        assert_eq!(put, Response::Ack);

        for i in 0..2 {
            let got = cluster
                .engine(i)
                .invoke_on_partition(get_op(key))
                .await
                .unwrap();
            assert_eq!(got, Response::value(b"v1".to_vec()), "key {key} via node {i}");
        }
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn locality_failures_match() {
    let cluster = TestCluster::start(2).await;

    let local = cluster
        .engine(0)
        .invoke(Operation::new("missing", "x"), address(0))
        .await
        .unwrap_err();
    let remote = cluster
        .engine(0)
        .invoke(Operation::new("missing", "x"), address(1))
        .await
        .unwrap_err();
    assert!(matches!(local, EngineError::UnknownService(ref s) if s == "missing"));
    assert!(matches!(remote, EngineError::UnknownService(ref s) if s == "missing"));

    let key = key_owned_by(&cluster, 1);
    let local = cluster
        .engine(1)
        .invoke_on_partition(unlock_op(&key, "nobody"))
        .await
        .unwrap_err();
    let remote = cluster
        .engine(0)
        .invoke_on_partition(unlock_op(&key, "nobody"))
        .await
        .unwrap_err();
    assert_eq!(local.to_string(), remote.to_string());
    cluster.shutdown().await;
}

#[tokio::test]
async fn locality_wrong_target_reported_by_stale_owner() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 1);

    let err = cluster
        .engine(0)
        .invoke(get_op(&key), address(0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WrongTarget { owner: Some(ref a), .. } if a == &address(1)));
    cluster.shutdown().await;
}

// =============================================================================
// Wait / notify
// =============================================================================

#[tokio::test]
async fn wait_lock_released_resumes_waiter() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 1);
    let caller = Arc::clone(cluster.engine(0));

    caller
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(30)))
        .await
        .unwrap();

    let waiter = {
        let caller = Arc::clone(&caller);
        let key = key.clone();
        tokio::spawn(async move {
            caller
                .invoke_on_partition(lock_op(&key, "t2", Duration::from_secs(30)))
                .await
        })
    };
    let owner = Arc::clone(cluster.engine(1));
    eventually(|| owner.waiting_operations() == 1).await;

    caller
        .invoke_on_partition(unlock_op(&key, "t1"))
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), Response::Ack);

    let holder = caller
        .invoke_on_partition(get_owner(&key))
        .await
        .unwrap();
    assert_eq!(holder, Response::value(b"t2".to_vec()));
    assert_eq!(owner.waiting_operations(), 0);
    cluster.shutdown().await;
}

fn get_owner(key: &str) -> Operation {
    let mut op = get_op(key);
    op.name = "owner".to_string();
    op
}

#[tokio::test]
async fn wait_notify_resumes_in_fifo_order() {
    let cluster = TestCluster::start(1).await;
    let engine = Arc::clone(cluster.engine(0));
    let key = "fifo";

    engine
        .invoke_on_partition(lock_op(key, "t0", Duration::from_secs(30)))
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 1..=3 {
        let worker = Arc::clone(&engine);
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let owner = format!("t{i}");
            worker
                .invoke_on_partition(lock_op(key, &owner, Duration::from_secs(30)))
                .await
                .unwrap();
            order.lock().push(owner.clone());
            worker
                .invoke_on_partition(unlock_op(key, &owner))
                .await
                .unwrap();
        }));
        let expected = i;
        eventually(|| engine.waiting_operations() == expected).await;
    }

    engine
        .invoke_on_partition(unlock_op(key, "t0"))
        .await
        .unwrap();
    for result in futures::future::join_all(waiters).await {
        result.unwrap();
    }
    assert_eq!(*order.lock(), vec!["t1", "t2", "t3"]);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn wait_deadline_resolves_with_timeout() {
    let cluster = TestCluster::start(1).await;
    let engine = cluster.engine(0);

    engine
        .invoke_on_partition(lock_op("w", "t1", Duration::from_secs(30)))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = engine
        .invoke_on_partition(lock_op("w", "t2", Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(outcome, Response::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(31));
    assert_eq!(engine.waiting_operations(), 0);
    cluster.shutdown().await;
}

// =============================================================================
// Topology
// =============================================================================

#[tokio::test]
async fn topology_member_left_fails_invocations_to_it() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 1);
    let caller = Arc::clone(cluster.engine(0));

    caller
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(30)))
        .await
        .unwrap();
    let pending = {
        let caller = Arc::clone(&caller);
        let key = key.clone();
        tokio::spawn(async move {
            caller
                .invoke(lock_op(&key, "t2", Duration::from_secs(30)), address(1))
                .await
        })
    };
    let owner = Arc::clone(cluster.engine(1));
    eventually(|| owner.waiting_operations() == 1).await;

    cluster.kill(1);
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::MemberLeft { address: ref gone } if gone == &address(1)));
    assert_eq!(*cluster.node(0).kv.left.lock(), vec![address(1)]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn topology_waiter_of_departed_caller_discarded() {
    let cluster = TestCluster::start(3).await;
    let key = key_owned_by(&cluster, 1);

    cluster
        .engine(0)
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(30)))
        .await
        .unwrap();
    let orphan = {
        let caller = Arc::clone(cluster.engine(2));
        let key = key.clone();
        tokio::spawn(async move {
            caller
                .invoke_on_partition(lock_op(&key, "t2", Duration::from_secs(30)))
                .await
        })
    };
    let owner = Arc::clone(cluster.engine(1));
    eventually(|| owner.waiting_operations() == 1).await;

    cluster.kill(2);
    assert_eq!(owner.waiting_operations(), 0);
    orphan.abort();
    cluster.shutdown().await;
}

#[tokio::test]
async fn topology_invalidated_waiter_follows_new_owner() {
    let cluster = TestCluster::start(3).await;
    let key = key_owned_by(&cluster, 1);
    let partition_id = partition_for(&key);

    cluster
        .engine(1)
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(30)))
        .await
        .unwrap();
    let waiter = {
        let caller = Arc::clone(cluster.engine(0));
        let key = key.clone();
        tokio::spawn(async move {
            caller
                .invoke_on_partition(lock_op(&key, "t2", Duration::from_secs(30)))
                .await
        })
    };
    let old_owner = Arc::clone(cluster.engine(1));
    eventually(|| old_owner.waiting_operations() == 1).await;

    // node 2 leaves and the partition is reassigned to node 0 at the same time
    cluster.table.set_owner(partition_id, address(0));
    cluster.kill(2);

    assert_eq!(waiter.await.unwrap().unwrap(), Response::Ack);
    assert_eq!(old_owner.waiting_operations(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn topology_migration_away_invalidates_waiters() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 0);
    let partition_id = partition_for(&key);
    let engine = Arc::clone(cluster.engine(0));

    engine
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(30)))
        .await
        .unwrap();
    let waiter = {
        let engine = Arc::clone(&engine);
        let key = key.clone();
        tokio::spawn(async move {
            engine
                .invoke_on_partition(lock_op(&key, "t2", Duration::from_secs(30)))
                .await
        })
    };
    eventually(|| engine.waiting_operations() == 1).await;

    let migration = MigrationInfo {
        partition_id,
        source: address(0),
        destination: address(1),
    };
    cluster.table.apply_migration(&migration);
    engine.on_partition_migrate(&migration);

    // re-run lands on node 1, where the key is free
    assert_eq!(waiter.await.unwrap().unwrap(), Response::Ack);
    assert_eq!(engine.waiting_operations(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn topology_disconnect_reaches_membership_services() {
    let cluster = TestCluster::start(2).await;
    cluster.engine(0).on_member_disconnect(&address(1));
    assert_eq!(*cluster.node(0).kv.disconnected.lock(), vec![address(1)]);
    assert!(cluster.node(0).kv.left.lock().is_empty());
    cluster.shutdown().await;
}

// =============================================================================
// Backups
// =============================================================================

#[tokio::test]
async fn backup_sync_ack_before_completion() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 0);
    let backup = cluster.backup_of(&key);
    assert_eq!(backup, 1);

    cluster
        .engine(1)
        .invoke_on_partition(put_op(&key, b"replicated"))
        .await
        .unwrap();
    assert_eq!(cluster.node(backup).kv.value(&key), Some(b"replicated".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn backup_overwrite_keeps_size_exact() {
    let cluster = TestCluster::start(2).await;
    let key = "K1";
    let backup = cluster.backup_of(key);
    let engine = cluster.engine(0);

    engine.invoke_on_partition(put_op(key, b"V1")).await.unwrap();
    assert_eq!(cluster.node(backup).kv.store_size(key), 2);

    engine
        .invoke_on_partition(put_op(key, b"V2-longer"))
        .await
        .unwrap();
    let kv = &cluster.node(backup).kv;
    assert_eq!(kv.value(key), Some(b"V2-longer".to_vec()));
    assert_eq!(kv.store_size(key), 9);

    engine.invoke_on_partition(put_op(key, b"V")).await.unwrap();
    assert_eq!(kv.store_size(key), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn backup_unlock_forces_replica_unlock() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 0);
    let backup = cluster.backup_of(&key);

    // replica holds a stale lock for the key
    let replica = cluster
        .node(backup)
        .kv
        .stores
        .get_or_create(partition_for(&key), STORE);
    assert!(replica.lock().lock(key.as_bytes(), "stale"));

    let engine = cluster.engine(0);
    engine
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(5)))
        .await
        .unwrap();
    engine
        .invoke_on_partition(unlock_op(&key, "t1"))
        .await
        .unwrap();

    eventually(|| replica.lock().lock_owner(key.as_bytes()).is_none()).await;
    assert_eq!(replica.lock().size_estimator().size(), 0);
    cluster.shutdown().await;
}

// =============================================================================
// Post-join, events, proxies
// =============================================================================

#[tokio::test]
async fn post_join_recreates_proxies() {
    let cluster = TestCluster::start(2).await;
    cluster
        .engine(0)
        .proxies()
        .get_or_create_proxy(KV, "users")
        .unwrap();
    assert_eq!(cluster.engine(1).proxies().proxy_count(), 0);

    let sent = cluster.engine(0).send_post_join_operations(&address(1));
    assert_eq!(sent, 1);

    let joiner = Arc::clone(cluster.engine(1));
    eventually(|| joiner.proxies().proxy_count() == 1).await;
    assert_eq!(joiner.proxies().proxies()[0].object_name, "users");
    cluster.shutdown().await;
}

#[tokio::test]
async fn post_join_applied_locally() {
    let cluster = TestCluster::start(2).await;
    cluster
        .engine(0)
        .proxies()
        .get_or_create_proxy(KV, "orders")
        .unwrap();

    let ops = cluster.engine(0).post_join_operations();
    cluster.engine(1).run_post_join_operations(ops);
    assert_eq!(cluster.engine(1).proxies().proxy_count(), 1);

    // partition-affine candidates are refused
    cluster
        .engine(1)
        .run_post_join_operations(vec![put_op("x", b"y")]);
    assert_eq!(cluster.node(1).kv.value("x"), None);
    cluster.shutdown().await;
}

struct Collect(Mutex<Vec<Event>>);

impl EventListener for Collect {
    fn on_event(&self, event: &Event) {
        self.0.lock().push(event.clone());
    }
}

#[tokio::test]
async fn event_published_to_remote_listener() {
    let cluster = TestCluster::start(2).await;
    let listener = Arc::new(Collect(Mutex::new(Vec::new())));
    cluster
        .engine(1)
        .events()
        .register_listener(KV, "changes", listener.clone());

    let publisher = Arc::clone(cluster.engine(0));
    eventually(|| publisher.events().registrations(KV, "changes").len() == 1).await;

    let targeted = publisher.events().publish(KV, "changes", b"k1 updated".to_vec());
    assert_eq!(targeted, 1);
    eventually(|| listener.0.lock().len() == 1).await;

    let event = listener.0.lock()[0].clone();
    assert_eq!(event.payload, b"k1 updated");
    assert_eq!(event.publisher, address(0));
    cluster.shutdown().await;
}

#[tokio::test]
async fn proxy_destroy_reaches_every_member() {
    let cluster = TestCluster::start(2).await;
    for i in 0..2 {
        cluster
            .engine(i)
            .proxies()
            .get_or_create_proxy(KV, "sessions")
            .unwrap();
    }

    assert!(cluster.engine(0).proxies().destroy_proxy(KV, "sessions"));
    let other = Arc::clone(cluster.engine(1));
    eventually(|| other.proxies().proxy_count() == 0).await;
    assert_eq!(*cluster.node(1).kv.destroyed.lock(), vec!["sessions"]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn async_invocation_callback_receives_outcome() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 1);
    cluster
        .engine(0)
        .invoke_on_partition(put_op(&key, b"async"))
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    cluster
        .engine(0)
        .invoke_async(get_op(&key), None, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), Response::value(b"async".to_vec()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_remote_waiters() {
    let cluster = TestCluster::start(2).await;
    let key = key_owned_by(&cluster, 1);
    cluster
        .engine(0)
        .invoke_on_partition(lock_op(&key, "t1", Duration::from_secs(30)))
        .await
        .unwrap();

    let waiter = {
        let caller = Arc::clone(cluster.engine(0));
        let key = key.clone();
        tokio::spawn(async move {
            caller
                .invoke(lock_op(&key, "t2", Duration::from_secs(30)), address(1))
                .await
        })
    };
    let owner = Arc::clone(cluster.engine(1));
    eventually(|| owner.waiting_operations() == 1).await;

    owner.shutdown().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Shutdown));
    cluster.shutdown().await;
}
