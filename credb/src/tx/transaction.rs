//! Server-side transaction processing: lock planning, prepare (validate
//! reads under the planned locks) and commit (apply writes, stitch the
//! transaction ledger entry, emit witness fragments).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CResult, Error};
use crate::ledger::{Ledger, LockHandle};
use crate::policy::{IdentityUid, OpContext};
use crate::sync::LockType;
use crate::types::{ShardId, TaskId, TransactionId, NUM_SHARDS};
use crate::witness::WitnessBuilder;

use super::op::{Operation, TxContext};
use super::tx_ledger::{TransactionEntry, TransactionLedger};
use super::{IsolationLevel, OpSet, TransactionState};

pub struct Transaction {
    ledger: Arc<Ledger>,
    tx_ledger: Arc<TransactionLedger>,

    isolation: IsolationLevel,

    /// Identity uid of the node the transaction originated on.
    root: IdentityUid,

    /// Local identifier; (root, id) is globally unique.
    id: TransactionId,

    /// Was this transaction initiated by a remote coordinator?
    is_remote: bool,

    state: TransactionState,
    error: Option<String>,

    /// Locks to take during prepare, keyed by shard so iteration order is
    /// ascending and deadlock-free. Write subsumes read.
    lock_plan: BTreeMap<ShardId, LockType>,

    ops: Vec<Box<dyn Operation>>,

    /// Task id -> op-context string, recorded into the ledger entry.
    op_contexts: BTreeMap<TaskId, String>,

    /// Child peers participating in this transaction.
    children: BTreeSet<IdentityUid>,

    /// Non-blocking: a failed acquisition during distributed prepare must
    /// abort, not wait, or peers locking each other's shards deadlock.
    lock_handle: LockHandle<'static>,

    witness: Option<WitnessBuilder>,
}

impl Transaction {
    pub fn new(
        ledger: Arc<Ledger>,
        tx_ledger: Arc<TransactionLedger>,
        isolation: IsolationLevel,
        root: IdentityUid,
        id: TransactionId,
        is_remote: bool,
    ) -> Self {
        let lock_handle = LockHandle::nonblocking(ledger.clone());

        Self {
            ledger,
            tx_ledger,
            isolation,
            root,
            id,
            is_remote,
            state: TransactionState::Pending,
            error: None,
            lock_plan: BTreeMap::new(),
            ops: Vec::new(),
            op_contexts: BTreeMap::new(),
            children: BTreeSet::new(),
            lock_handle,
            witness: None,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn root(&self) -> IdentityUid {
        self.root
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, TransactionState::Committed | TransactionState::Aborted)
    }

    /// A transaction is distributed when any other node takes part.
    pub fn is_distributed(&self) -> bool {
        self.is_remote || !self.children.is_empty()
    }

    pub fn add_child(&mut self, child: IdentityUid) {
        if self.state != TransactionState::Pending {
            log::error!("cannot add child: invalid transaction state");
            return;
        }
        self.children.insert(child);
    }

    pub fn children(&self) -> impl Iterator<Item = IdentityUid> + '_ {
        self.children.iter().copied()
    }

    /// Register a pending operation and fold its locks into the plan.
    pub fn register(&mut self, task: TaskId, op_context: &OpContext, op: Box<dyn Operation>) {
        op.collect_shard_locks(self.isolation, &mut self.lock_plan);
        self.op_contexts.entry(task).or_insert_with(|| op_context.source());
        self.ops.push(op);
    }

    /// Validate the transaction and acquire every planned lock, in
    /// ascending shard order.
    pub fn prepare(&mut self, generate_witness: bool) -> CResult<()> {
        if self.state != TransactionState::Pending {
            return Err(Error::Internal("cannot prepare: invalid state".into()));
        }

        // Acquire all shard locks up front, so validation and writes see a
        // stable snapshot. BTreeMap iterates shards in ascending order.
        for (shard_no, lock_type) in &self.lock_plan {
            if let Err(err) = self.lock_handle.acquire(*shard_no, *lock_type) {
                self.error = Some("lock contention".into());
                self.abort();
                return Err(err);
            }
        }

        if generate_witness {
            self.witness = Some(WitnessBuilder::new(self.isolation.as_str()));
        }

        let ctx = TxContext {
            ledger: self.ledger.as_ref(),
            lock_handle: &self.lock_handle,
            isolation: self.isolation,
        };

        for op in &self.ops {
            if let Err(err) = op.validate(&ctx, self.witness.as_mut()) {
                self.error = Some(err.to_string());
                self.abort();
                return Err(err);
            }
        }

        self.state = TransactionState::Prepared;
        Ok(())
    }

    /// Apply the transaction: reserve event ids, append the transaction
    /// ledger entry, run every op's write in insertion order.
    ///
    /// Returns the witness digest when one was requested at prepare.
    pub fn commit(&mut self) -> CResult<Option<Value>> {
        if self.state != TransactionState::Prepared {
            return Err(Error::Internal("cannot commit: invalid state".into()));
        }

        let mut reads = BTreeSet::new();
        let mut write_counts = [0u16; NUM_SHARDS as usize];
        for op in &self.ops {
            op.extract_reads(&mut reads);
            op.extract_writes(&mut write_counts);
        }

        // Reserve the event ids the writes are about to occupy, so the
        // ledger entry can be stitched before any write lands.
        let mut writes = Vec::new();
        for (shard_no, count) in write_counts.iter().enumerate() {
            if *count > 0 {
                writes.extend(self.ledger.get_next_event_ids(
                    shard_no as ShardId,
                    *count,
                    &self.lock_handle,
                )?);
            }
        }

        let entry = TransactionEntry {
            op_contexts: self.op_contexts.clone(),
            root: self.root,
            tx_id: self.id,
            local: OpSet { reads: reads.into_iter().collect(), writes },
            remote: BTreeMap::new(),
        };
        let tx_ref = self.tx_ledger.insert(&entry)?;

        let ctx = TxContext {
            ledger: self.ledger.as_ref(),
            lock_handle: &self.lock_handle,
            isolation: self.isolation,
        };

        for op in &self.ops {
            op.do_write(&ctx, tx_ref, self.witness.as_mut())?;
        }

        let digest = self.witness.take().map(|witness| witness.build());

        self.state = TransactionState::Committed;
        self.cleanup()?;
        Ok(digest)
    }

    /// Discard the transaction and release every lock. Committed
    /// transactions cannot be undone.
    pub fn abort(&mut self) {
        match self.state {
            TransactionState::Aborted => {}
            TransactionState::Pending | TransactionState::Prepared => {
                self.state = TransactionState::Aborted;
                self.lock_handle.clear();
                self.ops.clear();
                self.witness = None;
            }
            TransactionState::Committed => {
                log::error!("cannot abort transaction: already committed");
            }
        }
    }

    fn cleanup(&mut self) -> CResult<()> {
        self.lock_handle.clear();
        self.ops.clear();

        // Written shards may have outgrown their pending blocks.
        if self.state == TransactionState::Committed && !self.is_remote {
            for (shard_no, lock_type) in &self.lock_plan {
                if *lock_type == LockType::Write {
                    self.ledger.organize_ledger(*shard_no)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::{test_context, test_ledger};
    use crate::page::{BufferManager, MemoryStore};
    use crate::tx::op::{FindOp, GetOp, HasOp, PutOp, RemoveOp};
    use serde_json::json;

    const COLLECTION: &str = "test";

    fn setup() -> CResult<(Arc<Ledger>, Arc<TransactionLedger>)> {
        let ledger = test_ledger()?;
        let tx_ledger = Arc::new(TransactionLedger::new(ledger.buffer().clone())?);
        Ok((ledger, tx_ledger))
    }

    fn tx(ledger: &Arc<Ledger>, tx_ledger: &Arc<TransactionLedger>, isolation: IsolationLevel) -> Transaction {
        Transaction::new(ledger.clone(), tx_ledger.clone(), isolation, 1, 1, false)
    }

    #[test]
    fn put_commits_with_transaction_reference() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::ReadCommitted);
        txn.register(
            1,
            &ctx,
            Box::new(PutOp::new(&ledger, ctx.clone(), COLLECTION, "foo", json!({"a": 42}))),
        );

        txn.prepare(false)?;
        assert_eq!(txn.state(), TransactionState::Prepared);
        assert!(txn.commit()?.is_none());
        assert_eq!(txn.state(), TransactionState::Committed);

        let (eid, value) = ledger.get(&ctx, COLLECTION, "foo", "", None)?.unwrap();
        assert_eq!(value, json!({"a": 42}));

        // The written event references the transaction ledger entry, and
        // that entry's write set contains the event.
        let handle = ledger.handle();
        let event = ledger.get_event(&eid, &handle, LockType::Read)?;
        let tx_ref = event.tx_ref.unwrap();
        let entry = tx_ledger.get(tx_ref)?;
        assert!(entry.local.writes.contains(&eid));
        assert_eq!(entry.root, 1);
        Ok(())
    }

    #[test]
    fn repeatable_read_aborts_on_change() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        let (eid, _) = {
            ledger.put(&ctx, COLLECTION, "foo", &json!({"v": 1}), "", None)?;
            ledger.get(&ctx, COLLECTION, "foo", "", None)?.unwrap()
        };

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::RepeatableRead);
        txn.register(1, &ctx, Box::new(GetOp::new(&ledger, ctx.clone(), COLLECTION, "foo", eid)));

        // A sneaky write between record and prepare changes the latest id.
        ledger.put(&ctx, COLLECTION, "foo", &json!({"v": 2}), "", None)?;

        let err = txn.prepare(false).unwrap_err();
        assert!(matches!(err, Error::TransactionAborted(_)));
        assert_eq!(txn.state(), TransactionState::Aborted);
        Ok(())
    }

    #[test]
    fn read_committed_tolerates_newer_versions() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "foo", &json!({"v": 1}), "", None)?;
        let (eid, _) = ledger.get(&ctx, COLLECTION, "foo", "", None)?.unwrap();

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::ReadCommitted);
        txn.register(1, &ctx, Box::new(GetOp::new(&ledger, ctx.clone(), COLLECTION, "foo", eid)));

        ledger.put(&ctx, COLLECTION, "foo", &json!({"v": 2}), "", None)?;

        // Still exists, so read committed is satisfied.
        txn.prepare(false)?;
        txn.commit()?;
        Ok(())
    }

    #[test]
    fn serializable_find_detects_phantoms() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "k1", &json!({"b": 23}), "", None)?;

        let find = FindOp::record(&ledger, ctx.clone(), COLLECTION, json!({"b": 23}), vec![], None)?;
        assert_eq!(find.result().len(), 1);

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::Serializable);
        txn.register(1, &ctx, Box::new(find));

        // A new matching object appears before prepare: phantom.
        ledger.put(&ctx, COLLECTION, "k2", &json!({"b": 23}), "", None)?;

        let err = txn.prepare(false).unwrap_err();
        assert!(matches!(err, Error::TransactionAborted(_)));
        Ok(())
    }

    #[test]
    fn prepare_fails_on_lock_contention() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "foo", &json!(1), "", None)?;
        let shard_no = ledger.shard_of(COLLECTION, "foo");

        // Someone else holds the shard write lock.
        ledger.shard(shard_no).lockable().write_lock();

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::ReadCommitted);
        txn.register(
            1,
            &ctx,
            Box::new(PutOp::new(&ledger, ctx.clone(), COLLECTION, "foo", json!(2))),
        );

        let err = txn.prepare(false).unwrap_err();
        assert_eq!(err, Error::LockContention);
        assert_eq!(txn.state(), TransactionState::Aborted);

        ledger.shard(shard_no).lockable().write_unlock();
        Ok(())
    }

    #[test]
    fn abort_releases_locks() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::ReadCommitted);
        txn.register(
            1,
            &ctx,
            Box::new(PutOp::new(&ledger, ctx.clone(), COLLECTION, "foo", json!(1))),
        );
        txn.prepare(false)?;
        txn.abort();

        // The shard is free again.
        let shard_no = ledger.shard_of(COLLECTION, "foo");
        assert!(ledger.shard(shard_no).lockable().try_write_lock());
        ledger.shard(shard_no).lockable().write_unlock();

        // Nothing was written.
        assert_eq!(ledger.get(&ctx, COLLECTION, "foo", "", None)?, None);
        Ok(())
    }

    #[test]
    fn witness_records_ops_in_insertion_order() -> CResult<()> {
        let (ledger, tx_ledger) = setup()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "existing", &json!({"x": 1}), "", None)?;

        let mut txn = tx(&ledger, &tx_ledger, IsolationLevel::RepeatableRead);
        txn.register(
            1,
            &ctx,
            Box::new(HasOp::new(&ledger, COLLECTION, "existing", true)),
        );
        txn.register(
            1,
            &ctx,
            Box::new(PutOp::new(&ledger, ctx.clone(), COLLECTION, "fresh", json!({"y": 2}))),
        );
        txn.register(1, &ctx, Box::new(RemoveOp::new(&ledger, ctx.clone(), COLLECTION, "existing")));

        txn.prepare(true)?;
        let digest = txn.commit()?.unwrap();

        let ops = digest["operations"].as_array().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0]["type"], json!("HasObject"));
        assert_eq!(ops[1]["type"], json!("PutObject"));
        assert_eq!(ops[2]["type"], json!("RemoveObject"));
        assert_eq!(digest["isolation"], json!("RepeatableRead"));
        Ok(())
    }

    #[test]
    fn buffer_is_shared_with_the_tx_ledger() -> CResult<()> {
        // The tx ledger allocates pages from the same buffer manager, so
        // its blocks and the data blocks never collide.
        let store = Arc::new(MemoryStore::new());
        let buffer = BufferManager::new(store, "shared", 1 << 22);
        let peers = Arc::new(crate::peer::Peers::new());
        let ledger = Ledger::new(buffer.clone(), Arc::new(crate::policy::AllowAll), peers)?;
        let tx_ledger = TransactionLedger::new(buffer)?;

        let entry = TransactionEntry {
            op_contexts: BTreeMap::new(),
            root: 1,
            tx_id: 1,
            local: OpSet::default(),
            remote: BTreeMap::new(),
        };
        let pos = tx_ledger.insert(&entry)?;
        assert!(pos.block > NUM_SHARDS as u32);
        let _ = ledger;
        Ok(())
    }
}
