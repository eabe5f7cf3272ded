//! Distributed transaction scenarios: two enclaves, two-phase commit,
//! composite witnesses, and degradation when a child dies mid-commit.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use credb::enclave::Enclave;
use credb::error::{CResult, Error};
use credb::page::MemoryStore;
use credb::peer::{PeerLink, PeerMessage, PeerResponse};
use credb::policy::{AllowAll, Identity, IdentityUid, OpContext};
use credb::protocol::{self, handle, Request, Response, TransactionOp};
use credb::tx::op::PutOp;
use credb::tx::{IsolationLevel, TransactionCoordinator};

const COLLECTION: &str = "test";

fn make_enclave(name: &str) -> CResult<Arc<Enclave>> {
    Ok(Arc::new(Enclave::with_buffer_size(
        name,
        Arc::new(MemoryStore::new()),
        Arc::new(AllowAll),
        1 << 24,
    )?))
}

fn client(name: &str) -> OpContext {
    OpContext::new(Identity::client(name))
}

/// A peer link that dispatches straight into another enclave, standing in
/// for the attested network transport.
struct LoopbackPeer {
    uid: IdentityUid,
    remote: Arc<Enclave>,

    /// When set, calls fail from this point on: the link "crashed".
    dead_after: Mutex<Option<usize>>,
    calls: Mutex<usize>,
}

impl LoopbackPeer {
    fn new(uid: IdentityUid, remote: Arc<Enclave>) -> Self {
        Self { uid, remote, dead_after: Mutex::new(None), calls: Mutex::new(0) }
    }

    fn kill_after(&self, calls: usize) {
        *self.dead_after.lock().unwrap() = Some(calls);
    }
}

impl PeerLink for LoopbackPeer {
    fn uid(&self) -> IdentityUid {
        self.uid
    }

    fn call(&self, message: PeerMessage) -> CResult<PeerResponse> {
        let mut calls = self.calls.lock().unwrap();
        if let Some(limit) = *self.dead_after.lock().unwrap() {
            if *calls >= limit {
                return Err(Error::TransactionAborted("peer link dropped".into()));
            }
        }
        *calls += 1;
        protocol::handle_peer_message(&self.remote, message)
    }

    fn send(&self, message: PeerMessage) -> CResult<()> {
        let _ = protocol::handle_peer_message(&self.remote, message);
        Ok(())
    }
}

fn local_value(enclave: &Enclave, ctx: &OpContext, key: &str) -> CResult<Option<Value>> {
    Ok(enclave.ledger().get(ctx, COLLECTION, key, "", None)?.map(|(_, value)| value))
}

/// Spec scenario: a Serializable transaction touching collections on the
/// coordinator and on peer B; the witness carries all four op records in
/// insertion order.
#[test]
fn two_phase_commit_across_two_peers() -> CResult<()> {
    let coordinator = make_enclave("node_a")?;
    let remote = make_enclave("node_b")?;
    let ctx = client("tester");

    let remote_uid = remote.uid();
    let link = Arc::new(LoopbackPeer::new(remote_uid, remote.clone()));
    coordinator.peers().add(link);

    // The coordinator's half of the transaction.
    let (tx_id, tx) =
        coordinator.tx_manager().init_local(IsolationLevel::Serializable, coordinator.uid());
    {
        let mut tx = tx.lock().unwrap();
        tx.add_child(remote_uid);
        tx.register(
            1,
            &ctx,
            Box::new(PutOp::new(
                coordinator.ledger(),
                ctx.clone(),
                COLLECTION,
                "local-1",
                json!({"n": 1}),
            )),
        );
        tx.register(
            1,
            &ctx,
            Box::new(PutOp::new(
                coordinator.ledger(),
                ctx.clone(),
                COLLECTION,
                "local-2",
                json!({"n": 2}),
            )),
        );
    }

    // The child's half, registered on B under the coordinator's (root, id).
    let child =
        remote.tx_manager().init_remote(IsolationLevel::Serializable, coordinator.uid(), tx_id);
    {
        let mut child = child.lock().unwrap();
        child.register(
            2,
            &ctx,
            Box::new(PutOp::new(
                remote.ledger(),
                ctx.clone(),
                COLLECTION,
                "remote-1",
                json!({"n": 3}),
            )),
        );
        child.register(
            2,
            &ctx,
            Box::new(PutOp::new(
                remote.ledger(),
                ctx.clone(),
                COLLECTION,
                "remote-2",
                json!({"n": 4}),
            )),
        );
    }

    let witness = TransactionCoordinator::execute(
        &tx,
        coordinator.peers(),
        coordinator.tx_manager(),
        true,
        coordinator.signing_key(),
    )?
    .unwrap();

    // Both halves are applied.
    assert_eq!(local_value(&coordinator, &ctx, "local-1")?, Some(json!({"n": 1})));
    assert_eq!(local_value(&coordinator, &ctx, "local-2")?, Some(json!({"n": 2})));
    assert_eq!(local_value(&remote, &ctx, "remote-1")?, Some(json!({"n": 3})));
    assert_eq!(local_value(&remote, &ctx, "remote-2")?, Some(json!({"n": 4})));

    // The composite witness lists all four operations in insertion order
    // and verifies against the coordinator's public key.
    assert!(witness.valid(&coordinator.public_key()));
    let ops = witness.digest()?["operations"].as_array().unwrap().clone();
    let keys: Vec<_> = ops.iter().map(|op| op["key"].as_str().unwrap().to_string()).collect();
    assert_eq!(keys, vec!["local-1", "local-2", "remote-1", "remote-2"]);
    assert_eq!(witness.digest()?["isolation"], json!("Serializable"));
    Ok(())
}

#[test]
fn child_prepare_failure_rolls_back_both_sides() -> CResult<()> {
    let coordinator = make_enclave("node_a")?;
    let remote = make_enclave("node_b")?;
    let ctx = client("tester");

    let remote_uid = remote.uid();
    coordinator.peers().add(Arc::new(LoopbackPeer::new(remote_uid, remote.clone())));

    let (tx_id, tx) =
        coordinator.tx_manager().init_local(IsolationLevel::RepeatableRead, coordinator.uid());
    {
        let mut tx = tx.lock().unwrap();
        tx.add_child(remote_uid);
        tx.register(
            1,
            &ctx,
            Box::new(PutOp::new(coordinator.ledger(), ctx.clone(), COLLECTION, "local", json!(1))),
        );
    }

    // The child cannot prepare: its shard lock is taken.
    let child = remote
        .tx_manager()
        .init_remote(IsolationLevel::RepeatableRead, coordinator.uid(), tx_id);
    child.lock().unwrap().register(
        2,
        &ctx,
        Box::new(PutOp::new(remote.ledger(), ctx.clone(), COLLECTION, "remote", json!(2))),
    );

    let contended = remote.ledger().shard_of(COLLECTION, "remote");
    remote.ledger().shard(contended).lockable().write_lock();

    let err = TransactionCoordinator::execute(
        &tx,
        coordinator.peers(),
        coordinator.tx_manager(),
        false,
        coordinator.signing_key(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::TransactionAborted(_)));

    remote.ledger().shard(contended).lockable().write_unlock();

    // Neither side has the writes.
    assert_eq!(local_value(&coordinator, &ctx, "local")?, None);
    assert_eq!(local_value(&remote, &ctx, "remote")?, None);
    // The child transaction is gone from B's manager.
    assert!(remote.tx_manager().get(coordinator.uid(), tx_id).is_err());
    Ok(())
}

/// A crash on the child during commit leaves the local commit applied and
/// degrades to a witness missing the child's records.
#[test]
fn child_crash_during_commit_keeps_local_outcome() -> CResult<()> {
    let coordinator = make_enclave("node_a")?;
    let remote = make_enclave("node_b")?;
    let ctx = client("tester");

    let remote_uid = remote.uid();
    let link = Arc::new(LoopbackPeer::new(remote_uid, remote.clone()));
    coordinator.peers().add(link.clone());

    let (tx_id, tx) =
        coordinator.tx_manager().init_local(IsolationLevel::Serializable, coordinator.uid());
    {
        let mut tx = tx.lock().unwrap();
        tx.add_child(remote_uid);
        tx.register(
            1,
            &ctx,
            Box::new(PutOp::new(
                coordinator.ledger(),
                ctx.clone(),
                COLLECTION,
                "local",
                json!({"n": 1}),
            )),
        );
    }

    let child =
        remote.tx_manager().init_remote(IsolationLevel::Serializable, coordinator.uid(), tx_id);
    child.lock().unwrap().register(
        2,
        &ctx,
        Box::new(PutOp::new(remote.ledger(), ctx.clone(), COLLECTION, "remote", json!({"n": 2}))),
    );

    // The link survives exactly one call (the prepare), then dies.
    link.kill_after(1);

    let witness = TransactionCoordinator::execute(
        &tx,
        coordinator.peers(),
        coordinator.tx_manager(),
        true,
        coordinator.signing_key(),
    )?
    .unwrap();

    // Local data-plane outcome stands.
    assert_eq!(local_value(&coordinator, &ctx, "local")?, Some(json!({"n": 1})));

    // Witness only covers the local operations.
    let ops = witness.digest()?["operations"].as_array().unwrap().clone();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["key"], json!("local"));
    Ok(())
}

#[test]
fn execute_transaction_isolation_levels() -> CResult<()> {
    let enclave = make_enclave("node_a")?;
    let ctx = client("tester");

    for isolation in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ] {
        let key = format!("key-{:?}", isolation);
        let (response, witness) = handle(
            &enclave,
            &ctx,
            Request::ExecuteTransaction {
                isolation,
                generate_witness: true,
                ops: vec![TransactionOp::Put {
                    collection: COLLECTION.into(),
                    key: key.clone(),
                    document: json!({"ok": true}),
                }],
            },
        )?;

        assert_eq!(response, Response::TxCommitted(true));
        let witness = witness.unwrap();
        assert_eq!(witness.digest()?["isolation"], json!(isolation.as_str()));
        assert_eq!(local_value(&enclave, &ctx, &key)?, Some(json!({"ok": true})));
    }
    Ok(())
}

#[test]
fn serializable_transaction_sees_phantoms() -> CResult<()> {
    let enclave = make_enclave("node_a")?;
    let ctx = client("tester");

    enclave.ledger().put(&ctx, COLLECTION, "k1", &json!({"b": 23}), "", None)?;

    // Record a find, then let a matching object appear before execute.
    let find = credb::tx::op::FindOp::record(
        enclave.ledger(),
        ctx.clone(),
        COLLECTION,
        json!({"b": 23}),
        vec![],
        None,
    )?;

    let (_, tx) = enclave.tx_manager().init_local(IsolationLevel::Serializable, enclave.uid());
    tx.lock().unwrap().register(1, &ctx, Box::new(find));

    enclave.ledger().put(&ctx, COLLECTION, "k2", &json!({"b": 23}), "", None)?;

    let err = TransactionCoordinator::execute(
        &tx,
        enclave.peers(),
        enclave.tx_manager(),
        false,
        enclave.signing_key(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::TransactionAborted(_)));
    Ok(())
}
