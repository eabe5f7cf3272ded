//! Pending operation records, one concrete type per opcode.
//!
//! Each record knows which shard locks it needs, how to validate its
//! reads during prepare (the meaning depends on the isolation level), and
//! how to apply itself to the ledger during commit. Read operations apply
//! as no-ops; write operations validate as fast feasibility checks.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{json, Value};

use crate::doc;
use crate::error::{CResult, Error};
use crate::ledger::{Ledger, LockHandle};
use crate::policy::{OpContext, OperationType};
use crate::sync::LockType;
use crate::types::{EventId, LedgerPos, ShardId, NUM_SHARDS};
use crate::witness::{WitnessBuilder, BLOCK_FIELD_NAME, INDEX_FIELD_NAME, SHARD_FIELD_NAME};

use super::IsolationLevel;

/// What an operation sees of its transaction while running.
pub struct TxContext<'a> {
    pub ledger: &'a Ledger,
    pub lock_handle: &'a LockHandle<'a>,
    pub isolation: IsolationLevel,
}

pub trait Operation: Send {
    fn op_type(&self) -> OperationType;

    /// Record the shard locks this operation needs before prepare.
    fn collect_shard_locks(&self, isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>);

    /// Check that the operation's reads are still valid. Semantics depend
    /// on the isolation level; write ops do a fast feasibility check.
    fn validate(&self, ctx: &TxContext<'_>, witness: Option<&mut WitnessBuilder>) -> CResult<()>;

    fn extract_reads(&self, _reads: &mut BTreeSet<EventId>) {}

    /// Per-shard write counts, used to pre-reserve event ids.
    fn extract_writes(&self, _writes: &mut [u16; NUM_SHARDS as usize]) {}

    /// Apply to the ledger. No-op for reads.
    fn do_write(
        &self,
        _ctx: &TxContext<'_>,
        _tx_ref: LedgerPos,
        _witness: Option<&mut WitnessBuilder>,
    ) -> CResult<()> {
        Ok(())
    }
}

fn plan_read(plan: &mut BTreeMap<ShardId, LockType>, shard: ShardId) {
    plan.entry(shard).or_insert(LockType::Read);
}

fn plan_write(plan: &mut BTreeMap<ShardId, LockType>, shard: ShardId) {
    plan.insert(shard, LockType::Write);
}

/// GetObject: the value read earlier must still be current.
pub struct GetOp {
    op_context: OpContext,
    collection: String,
    key: String,
    expected: EventId,
    shard: ShardId,
}

impl GetOp {
    pub fn new(
        ledger: &Ledger,
        op_context: OpContext,
        collection: &str,
        key: &str,
        expected: EventId,
    ) -> Self {
        let shard = ledger.shard_of(collection, key);
        Self { op_context, collection: collection.to_string(), key: key.to_string(), expected, shard }
    }
}

impl Operation for GetOp {
    fn op_type(&self) -> OperationType {
        OperationType::GetObject
    }

    fn collect_shard_locks(&self, _isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        plan_read(plan, self.shard);
    }

    fn extract_reads(&self, reads: &mut BTreeSet<EventId>) {
        reads.insert(self.expected);
    }

    fn validate(&self, ctx: &TxContext<'_>, witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let found = ctx.ledger.get_latest_version(
            &self.op_context,
            &self.collection,
            &self.key,
            "",
            ctx.lock_handle,
            LockType::Read,
            OperationType::GetObject,
        )?;

        let (eid, event) = match found {
            Some(found) => found,
            None => {
                return Err(Error::TransactionAborted(format!(
                    "get object [{}] reads outdated value",
                    self.key
                )))
            }
        };
        let value = event.value()?;
        ctx.lock_handle.release_block(eid.shard, eid.block, LockType::Read);

        if ctx.isolation != IsolationLevel::ReadCommitted && eid != self.expected {
            return Err(Error::TransactionAborted(format!(
                "non-repeatable read: key [{}] reads outdated value",
                self.key
            )));
        }

        if let Some(witness) = witness {
            witness.append(json!({
                "type": "GetObject",
                "key": self.key,
                SHARD_FIELD_NAME: self.expected.shard,
                BLOCK_FIELD_NAME: self.expected.block,
                INDEX_FIELD_NAME: self.expected.index,
                "content": value,
            }));
        }
        Ok(())
    }
}

/// HasObject: existence must not have flipped.
pub struct HasOp {
    collection: String,
    key: String,
    expected: bool,
    shard: ShardId,
}

impl HasOp {
    pub fn new(ledger: &Ledger, collection: &str, key: &str, expected: bool) -> Self {
        let shard = ledger.shard_of(collection, key);
        Self { collection: collection.to_string(), key: key.to_string(), expected, shard }
    }
}

impl Operation for HasOp {
    fn op_type(&self) -> OperationType {
        OperationType::HasObject
    }

    fn collect_shard_locks(&self, _isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        plan_read(plan, self.shard);
    }

    fn validate(&self, ctx: &TxContext<'_>, witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let result = ctx.ledger.has_object(&self.collection, &self.key)?;
        if result != self.expected {
            return Err(Error::TransactionAborted(format!(
                "has object [{}] reads outdated value",
                self.key
            )));
        }

        if let Some(witness) = witness {
            witness.append(json!({
                "type": "HasObject",
                "key": self.key,
                "result": self.expected,
            }));
        }
        Ok(())
    }
}

/// CheckObject: a predicate's verdict must not have flipped.
pub struct CheckOp {
    op_context: OpContext,
    collection: String,
    key: String,
    path: String,
    predicate: Value,
    expected: bool,
    shard: ShardId,
}

impl CheckOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: &Ledger,
        op_context: OpContext,
        collection: &str,
        key: &str,
        path: &str,
        predicate: Value,
        expected: bool,
    ) -> Self {
        let shard = ledger.shard_of(collection, key);
        Self {
            op_context,
            collection: collection.to_string(),
            key: key.to_string(),
            path: path.to_string(),
            predicate,
            expected,
            shard,
        }
    }
}

impl Operation for CheckOp {
    fn op_type(&self) -> OperationType {
        OperationType::CheckObject
    }

    fn collect_shard_locks(&self, _isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        plan_read(plan, self.shard);
    }

    fn validate(&self, ctx: &TxContext<'_>, witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let result = ctx.ledger.check(
            &self.op_context,
            &self.collection,
            &self.key,
            &self.path,
            &self.predicate,
            Some(ctx.lock_handle),
        )?;

        if result != self.expected {
            return Err(Error::TransactionAborted(format!(
                "check object [{}] reads outdated value",
                self.key
            )));
        }

        if let Some(witness) = witness {
            witness.append(json!({
                "type": "CheckObject",
                "key": self.key,
                "result": self.expected,
            }));
        }
        Ok(())
    }
}

/// PutObject (optionally into a path of the current value).
pub struct PutOp {
    op_context: OpContext,
    collection: String,
    key: String,
    path: String,
    doc: Value,
    shard: ShardId,
}

impl PutOp {
    pub fn new(
        ledger: &Ledger,
        op_context: OpContext,
        collection: &str,
        full_key: &str,
        doc: Value,
    ) -> Self {
        let (key, path) = doc::split_path(full_key);
        let shard = ledger.shard_of(collection, key);
        Self {
            op_context,
            collection: collection.to_string(),
            key: key.to_string(),
            path: path.to_string(),
            doc,
            shard,
        }
    }
}

impl Operation for PutOp {
    fn op_type(&self) -> OperationType {
        OperationType::PutObject
    }

    fn collect_shard_locks(&self, _isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        plan_write(plan, self.shard);
    }

    fn extract_writes(&self, writes: &mut [u16; NUM_SHARDS as usize]) {
        writes[self.shard as usize] += 1;
    }

    fn validate(&self, ctx: &TxContext<'_>, _witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let feasible = ctx.ledger.prepare_write(
            &self.op_context,
            &self.collection,
            &self.key,
            &self.path,
            OperationType::PutObject,
            ctx.lock_handle,
        )?;

        if !feasible {
            return Err(Error::TransactionAborted(format!("cannot put [{}]", self.key)));
        }
        Ok(())
    }

    fn do_write(
        &self,
        ctx: &TxContext<'_>,
        tx_ref: LedgerPos,
        witness: Option<&mut WitnessBuilder>,
    ) -> CResult<()> {
        let eid = ctx.ledger.write_version(
            &self.op_context,
            &self.collection,
            &self.key,
            &self.doc,
            &self.path,
            Some(ctx.lock_handle),
            crate::ledger::WriteMode::Replace,
            Some(tx_ref),
        )?;

        if let Some(witness) = witness {
            if eid.is_valid() {
                witness.append(json!({
                    "type": "PutObject",
                    "collection": self.collection,
                    "key": self.key,
                    SHARD_FIELD_NAME: eid.shard,
                    BLOCK_FIELD_NAME: eid.block,
                    INDEX_FIELD_NAME: eid.index,
                    "content": self.doc,
                }));
            }
        }
        Ok(())
    }
}

/// AddToObject: merge a delta into the current value.
pub struct AddOp {
    op_context: OpContext,
    collection: String,
    key: String,
    path: String,
    delta: Value,
    shard: ShardId,
}

impl AddOp {
    pub fn new(
        ledger: &Ledger,
        op_context: OpContext,
        collection: &str,
        full_key: &str,
        delta: Value,
    ) -> Self {
        let (key, path) = doc::split_path(full_key);
        let shard = ledger.shard_of(collection, key);
        Self {
            op_context,
            collection: collection.to_string(),
            key: key.to_string(),
            path: path.to_string(),
            delta,
            shard,
        }
    }
}

impl Operation for AddOp {
    fn op_type(&self) -> OperationType {
        OperationType::AddToObject
    }

    fn collect_shard_locks(&self, _isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        plan_write(plan, self.shard);
    }

    fn extract_writes(&self, writes: &mut [u16; NUM_SHARDS as usize]) {
        writes[self.shard as usize] += 1;
    }

    fn validate(&self, ctx: &TxContext<'_>, _witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let feasible = ctx.ledger.prepare_write(
            &self.op_context,
            &self.collection,
            &self.key,
            &self.path,
            OperationType::AddToObject,
            ctx.lock_handle,
        )?;

        if !feasible {
            return Err(Error::TransactionAborted(format!("cannot add to [{}]", self.key)));
        }
        Ok(())
    }

    fn do_write(
        &self,
        ctx: &TxContext<'_>,
        tx_ref: LedgerPos,
        witness: Option<&mut WitnessBuilder>,
    ) -> CResult<()> {
        let eid = ctx.ledger.write_version(
            &self.op_context,
            &self.collection,
            &self.key,
            &self.delta,
            &self.path,
            Some(ctx.lock_handle),
            crate::ledger::WriteMode::Merge,
            Some(tx_ref),
        )?;

        if let Some(witness) = witness {
            witness.append(json!({
                "type": "AddToObject",
                "key": self.key,
                SHARD_FIELD_NAME: eid.shard,
                BLOCK_FIELD_NAME: eid.block,
                INDEX_FIELD_NAME: eid.index,
                "content": self.delta,
            }));
        }
        Ok(())
    }
}

/// RemoveObject.
pub struct RemoveOp {
    op_context: OpContext,
    collection: String,
    key: String,
    shard: ShardId,
}

impl RemoveOp {
    pub fn new(ledger: &Ledger, op_context: OpContext, collection: &str, key: &str) -> Self {
        let shard = ledger.shard_of(collection, key);
        Self { op_context, collection: collection.to_string(), key: key.to_string(), shard }
    }
}

impl Operation for RemoveOp {
    fn op_type(&self) -> OperationType {
        OperationType::RemoveObject
    }

    fn collect_shard_locks(&self, _isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        plan_write(plan, self.shard);
    }

    fn extract_writes(&self, writes: &mut [u16; NUM_SHARDS as usize]) {
        writes[self.shard as usize] += 1;
    }

    fn validate(&self, ctx: &TxContext<'_>, _witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let feasible = ctx.ledger.prepare_write(
            &self.op_context,
            &self.collection,
            &self.key,
            "",
            OperationType::RemoveObject,
            ctx.lock_handle,
        )?;

        if !feasible {
            return Err(Error::TransactionAborted(format!("cannot remove [{}]", self.key)));
        }
        Ok(())
    }

    fn do_write(
        &self,
        ctx: &TxContext<'_>,
        tx_ref: LedgerPos,
        witness: Option<&mut WitnessBuilder>,
    ) -> CResult<()> {
        let eid = ctx.ledger.remove_with_ref(
            &self.op_context,
            &self.collection,
            &self.key,
            Some(ctx.lock_handle),
            Some(tx_ref),
        )?;

        if let Some(witness) = witness {
            witness.append(json!({
                "type": "RemoveObject",
                "key": self.key,
                SHARD_FIELD_NAME: eid.shard,
                BLOCK_FIELD_NAME: eid.block,
                INDEX_FIELD_NAME: eid.index,
            }));
        }
        Ok(())
    }
}

/// FindObjects: the result set captured at record time must still hold.
pub struct FindOp {
    op_context: OpContext,
    collection: String,
    predicates: Value,
    projection: Vec<String>,
    limit: Option<usize>,
    result: Vec<(String, ShardId, EventId)>,
}

impl FindOp {
    /// Execute the find now and capture its result set for validation.
    pub fn record(
        ledger: &Ledger,
        op_context: OpContext,
        collection: &str,
        predicates: Value,
        projection: Vec<String>,
        limit: Option<usize>,
    ) -> CResult<Self> {
        let mut result = Vec::new();
        {
            let mut iter =
                ledger.find(&op_context, collection, predicates.clone(), limit, None)?;
            while let Some((key, eid, _)) = iter.next_entry()? {
                let shard = ledger.shard_of(collection, &key);
                result.push((key, shard, eid));
            }
        }

        Ok(Self {
            op_context,
            collection: collection.to_string(),
            predicates,
            projection,
            limit,
            result,
        })
    }

    /// The captured result set, for returning to the client.
    pub fn result(&self) -> &[(String, ShardId, EventId)] {
        &self.result
    }

    fn write_result_witness(
        &self,
        witness: &mut WitnessBuilder,
        records: Vec<Value>,
    ) {
        witness.append(json!({
            "type": "FindObjects",
            "collection": self.collection,
            "predicates": self.predicates,
            "projection": self.projection,
            "limit": self.limit,
            "results": records,
        }));
    }

    fn result_record(&self, key: &str, eid: &EventId, value: &Value) -> Value {
        let content = if self.projection.is_empty() {
            value.clone()
        } else {
            doc::project(value, &self.projection)
        };

        json!({
            "key": key,
            SHARD_FIELD_NAME: eid.shard,
            BLOCK_FIELD_NAME: eid.block,
            INDEX_FIELD_NAME: eid.index,
            "content": content,
        })
    }

    fn validate_no_dirty_read(&self, ctx: &TxContext<'_>, records: &mut Vec<Value>, generate: bool) -> CResult<()> {
        for (key, _, eid) in &self.result {
            let found = ctx.ledger.get_latest_version(
                &self.op_context,
                &self.collection,
                key,
                "",
                ctx.lock_handle,
                LockType::Read,
                OperationType::FindObjects,
            )?;

            let (latest_eid, event) = match found {
                Some(found) => found,
                None => {
                    return Err(Error::TransactionAborted(format!(
                        "dirty read: key [{}] reads outdated value",
                        key
                    )))
                }
            };
            let value = event.value()?;
            ctx.lock_handle.release_block(latest_eid.shard, latest_eid.block, LockType::Read);

            if generate {
                records.push(self.result_record(key, eid, &value));
            }
        }
        Ok(())
    }

    fn validate_repeatable_read(&self, ctx: &TxContext<'_>, records: &mut Vec<Value>, generate: bool) -> CResult<()> {
        for (key, _, eid) in &self.result {
            let found = ctx.ledger.get_latest_version(
                &self.op_context,
                &self.collection,
                key,
                "",
                ctx.lock_handle,
                LockType::Read,
                OperationType::FindObjects,
            )?;

            let (latest_eid, event) = match found {
                Some(found) => found,
                None => {
                    return Err(Error::TransactionAborted(format!(
                        "non-repeatable read: key [{}] was removed",
                        key
                    )))
                }
            };
            let value = event.value()?;
            ctx.lock_handle.release_block(latest_eid.shard, latest_eid.block, LockType::Read);

            if latest_eid != *eid {
                return Err(Error::TransactionAborted(format!(
                    "non-repeatable read: key [{}] reads outdated value",
                    key
                )));
            }

            if generate {
                records.push(self.result_record(key, eid, &value));
            }
        }
        Ok(())
    }

    /// Serializable: replay the scan and require exactly the same keys.
    fn validate_no_phantom(&self, ctx: &TxContext<'_>, records: &mut Vec<Value>, generate: bool) -> CResult<()> {
        let mut expected: HashSet<EventId> = self.result.iter().map(|(_, _, eid)| *eid).collect();

        let mut iter = ctx.ledger.find(
            &self.op_context,
            &self.collection,
            self.predicates.clone(),
            self.limit,
            Some(ctx.lock_handle),
        )?;

        while let Some((key, eid, value)) = iter.next_entry()? {
            if !expected.remove(&eid) {
                return Err(Error::TransactionAborted(format!("phantom read: key [{}]", key)));
            }

            if generate {
                records.push(self.result_record(&key, &eid, &value));
            }
        }

        if !expected.is_empty() {
            return Err(Error::TransactionAborted("phantom read: too few results".into()));
        }
        Ok(())
    }
}

impl Operation for FindOp {
    fn op_type(&self) -> OperationType {
        OperationType::FindObjects
    }

    fn collect_shard_locks(&self, isolation: IsolationLevel, plan: &mut BTreeMap<ShardId, LockType>) {
        if isolation == IsolationLevel::Serializable {
            // Lock every shard so no phantom can slip into the replay.
            for shard in 0..NUM_SHARDS {
                plan_read(plan, shard);
            }
        } else {
            for (_, shard, _) in &self.result {
                plan_read(plan, *shard);
            }
        }
    }

    fn extract_reads(&self, reads: &mut BTreeSet<EventId>) {
        for (_, _, eid) in &self.result {
            reads.insert(*eid);
        }
    }

    fn validate(&self, ctx: &TxContext<'_>, witness: Option<&mut WitnessBuilder>) -> CResult<()> {
        let generate = witness.is_some();
        let mut records = Vec::new();

        match ctx.isolation {
            IsolationLevel::ReadCommitted => {
                self.validate_no_dirty_read(ctx, &mut records, generate)?
            }
            IsolationLevel::RepeatableRead => {
                self.validate_repeatable_read(ctx, &mut records, generate)?
            }
            IsolationLevel::Serializable => self.validate_no_phantom(ctx, &mut records, generate)?,
        }

        if let Some(witness) = witness {
            self.write_result_witness(witness, records);
        }
        Ok(())
    }
}
