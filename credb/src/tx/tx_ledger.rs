//! The transaction ledger: an append-only record of every committed
//! transaction. Events written by a transaction embed their entry's
//! position, which is what makes cross-shard ordering resolvable.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::ledger::Block;
use crate::page::BufferManager;
use crate::policy::IdentityUid;
use crate::types::{
    EventRange, LedgerPos, PageNo, TaskId, TransactionBounds, TransactionId, MIN_BLOCK_SIZE,
};

use super::OpSet;

/// One committed transaction's record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    /// Task id -> op-context string of whoever issued that task's ops.
    pub op_contexts: BTreeMap<TaskId, String>,

    /// Identity uid of the node the transaction originated on.
    pub root: IdentityUid,

    /// Transaction id, local to the root.
    pub tx_id: TransactionId,

    /// Events this node read and wrote.
    pub local: OpSet,

    /// Per-peer op sets for distributed transactions.
    pub remote: BTreeMap<IdentityUid, OpSet>,
}

impl TransactionEntry {
    /// The extent of this transaction on the local shards: min and max
    /// position per shard over everything it read or wrote.
    pub fn bounds(&self) -> TransactionBounds {
        let mut bounds = TransactionBounds::new();

        for eid in self.local.reads.iter().chain(self.local.writes.iter()) {
            let range = bounds.entry(eid.shard).or_insert(EventRange {
                start_block: eid.block,
                end_block: eid.block,
                start_index: eid.index,
                end_index: eid.index,
            });

            if (eid.block, eid.index) < (range.start_block, range.start_index) {
                range.start_block = eid.block;
                range.start_index = eid.index;
            }
            if (eid.block, eid.index) > (range.end_block, range.end_index) {
                range.end_block = eid.block;
                range.end_index = eid.index;
            }
        }

        bounds
    }

    fn encode(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> CResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Registry of committed transactions, stored in its own chain of
/// append-only blocks.
pub struct TransactionLedger {
    buffer: Arc<BufferManager>,
    state: Mutex<PageNo>,
}

impl TransactionLedger {
    pub fn new(buffer: Arc<BufferManager>) -> CResult<Self> {
        let pending = buffer.new_page(Block::new)?;
        pending.flush()?;
        Ok(Self { buffer, state: Mutex::new(pending.page_no()) })
    }

    /// Append an entry; its position becomes the transaction reference
    /// embedded into every event the transaction writes.
    pub fn insert(&self, entry: &TransactionEntry) -> CResult<LedgerPos> {
        let mut pending_id = self.state.lock().unwrap();

        let block = self.buffer.get_page::<Block>(*pending_id)?;
        let index = block.insert_raw(&entry.encode()?)?;
        block.mark_dirty();
        block.flush()?;

        let pos = LedgerPos { block: block.identifier(), index };

        // Seal and rotate once the block is big enough.
        if block.data_size() >= MIN_BLOCK_SIZE {
            block.seal();
            block.mark_dirty();
            block.flush()?;
            drop(block);

            let fresh = self.buffer.new_page(Block::new)?;
            fresh.flush()?;
            *pending_id = fresh.page_no();
        }

        Ok(pos)
    }

    pub fn get(&self, pos: LedgerPos) -> CResult<TransactionEntry> {
        let block = self.buffer.get_page::<Block>(pos.block)?;
        TransactionEntry::decode(&block.get_raw(pos.index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemoryStore;
    use crate::types::{order_bounds, EventId, OrderResult};

    fn setup() -> CResult<TransactionLedger> {
        let buffer = BufferManager::new(Arc::new(MemoryStore::new()), "test", 1 << 22);
        TransactionLedger::new(buffer)
    }

    fn entry(tx_id: TransactionId, writes: Vec<EventId>) -> TransactionEntry {
        TransactionEntry {
            op_contexts: BTreeMap::from([(1, "client://tester".to_string())]),
            root: 99,
            tx_id,
            local: OpSet { reads: vec![], writes },
            remote: BTreeMap::new(),
        }
    }

    #[test]
    fn insert_and_get() -> CResult<()> {
        let ledger = setup()?;

        let first = entry(1, vec![EventId::new(2, 1, 0)]);
        let second = entry(2, vec![EventId::new(2, 1, 1)]);

        let pos1 = ledger.insert(&first)?;
        let pos2 = ledger.insert(&second)?;
        assert_ne!(pos1, pos2);

        assert_eq!(ledger.get(pos1)?, first);
        assert_eq!(ledger.get(pos2)?, second);
        Ok(())
    }

    #[test]
    fn bounds_resolve_cross_entry_order() -> CResult<()> {
        let older = entry(1, vec![EventId::new(4, 1, 0), EventId::new(4, 1, 1)]);
        let newer = entry(2, vec![EventId::new(4, 1, 2)]);

        assert_eq!(order_bounds(&older.bounds(), &newer.bounds()), OrderResult::OlderThan);
        assert_eq!(order_bounds(&newer.bounds(), &older.bounds()), OrderResult::NewerThan);

        // no shared shard: unknown
        let elsewhere = entry(3, vec![EventId::new(9, 1, 0)]);
        assert_eq!(order_bounds(&older.bounds(), &elsewhere.bounds()), OrderResult::Unknown);
        Ok(())
    }

    #[test]
    fn rotation_after_min_block_size() -> CResult<()> {
        let ledger = setup()?;

        // Entries with fat op-context strings overflow one block.
        let mut positions = Vec::new();
        for i in 0..40 {
            let mut e = entry(i, vec![EventId::new(1, 1, i as u16)]);
            e.op_contexts.insert(2, "x".repeat(256));
            positions.push(ledger.insert(&e)?);
        }

        assert!(positions.iter().any(|pos| pos.block != positions[0].block));
        // all entries remain readable after rotation
        for (i, pos) in positions.iter().enumerate() {
            assert_eq!(ledger.get(*pos)?.tx_id, i as TransactionId);
        }
        Ok(())
    }
}
