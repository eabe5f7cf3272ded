use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

/// Identifier of a ledger shard (horizontal position).
pub type ShardId = u16;

/// Identifier of a block within a shard. Equal to the page number
/// of the page that holds the block.
pub type BlockId = u32;

/// Offset of an event inside a block.
pub type BlockIndex = u16;

/// Counts how many changes were made to an object.
pub type VersionNo = u32;

/// Page numbers handed out by the buffer manager.
pub type PageNo = u32;

/// Number of ledger shards. The key space is partitioned by
/// hash(collection, key) % NUM_SHARDS.
pub const NUM_SHARDS: ShardId = 20;

/// Smaller blocks are cheaper to move in and out of the enclave.
pub const MIN_BLOCK_SIZE: usize = 5 * 1024;

pub const INVALID_BLOCK: BlockId = 0;
pub const INVALID_PAGE_NO: PageNo = 0;

pub const INVALID_VERSION_NO: VersionNo = 0;
pub const INITIAL_VERSION_NO: VersionNo = 1;

/// Position of an event on a node's ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub shard: ShardId,
    pub block: BlockId,
    pub index: BlockIndex,
}

/// Sentinel for "no such event".
pub const INVALID_EVENT: EventId = EventId { shard: 0, block: INVALID_BLOCK, index: 0 };

/// Sentinel for an event that a transaction has reserved but not written yet.
pub const UNCOMMITTED_EVENT: EventId =
    EventId { shard: ShardId::MAX - 1, block: BlockId::MAX - 1, index: BlockIndex::MAX - 1 };

impl EventId {
    pub const fn new(shard: ShardId, block: BlockId, index: BlockIndex) -> Self {
        Self { shard, block, index }
    }

    /// An event id is valid iff it references a real block.
    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK && *self != UNCOMMITTED_EVENT
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.shard, self.block, self.index)
    }
}

/// Identifier of a transaction, local to its originating identity.
/// Together with the root identity uid this uniquely names a transaction.
pub type TransactionId = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;

/// Correlates RPC requests with the task that awaits their response.
pub type TaskId = u64;

/// Position of an entry in the transaction ledger. Events written by a
/// committed transaction embed this as their transaction reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerPos {
    pub block: BlockId,
    pub index: BlockIndex,
}

pub const INVALID_LEDGER_POS: LedgerPos = LedgerPos { block: INVALID_BLOCK, index: 0 };

impl LedgerPos {
    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK
    }
}

/// Result of ordering two events or event ranges on the timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderResult {
    Unknown,
    Equal,
    OlderThan,
    NewerThan,
    Concurrent,
}

/// Order two event identifiers. Only events in the same shard have a
/// defined local order; anything else needs the transaction ledger.
pub fn order_events(first: &EventId, second: &EventId) -> OrderResult {
    if first.shard != second.shard {
        return OrderResult::Unknown;
    }

    if (first.block, first.index) < (second.block, second.index) {
        OrderResult::OlderThan
    } else if first == second {
        OrderResult::Equal
    } else {
        OrderResult::NewerThan
    }
}

/// An interval on a single shard's timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRange {
    pub start_block: BlockId,
    pub end_block: BlockId,
    pub start_index: BlockIndex,
    pub end_index: BlockIndex,
}

impl EventRange {
    /// Is the event strictly before this range?
    pub fn is_after(&self, e: &EventId) -> bool {
        e.block < self.start_block || (e.block == self.start_block && e.index < self.start_index)
    }

    /// Is the event strictly after this range?
    pub fn is_before(&self, e: &EventId) -> bool {
        e.block > self.end_block || (e.block == self.end_block && e.index > self.end_index)
    }
}

/// Extent of a committed transaction across the ledger shards.
pub type TransactionBounds = HashMap<ShardId, EventRange>;

/// Order two event ranges on the same shard.
pub fn order_ranges(first: &EventRange, second: &EventRange) -> OrderResult {
    if first.end_block < second.start_block
        || (first.end_block == second.start_block && first.end_index < second.start_index)
    {
        OrderResult::OlderThan
    } else if first.start_block > second.end_block
        || (first.start_block == second.end_block && first.start_index > second.end_index)
    {
        OrderResult::NewerThan
    } else {
        OrderResult::Concurrent
    }
}

/// Order two transaction bounds with respect to each other.
///
/// Assumes both bounds come from valid, committed transactions. If the
/// transactions never touched a common shard the result is `Unknown`.
pub fn order_bounds(first: &TransactionBounds, second: &TransactionBounds) -> OrderResult {
    for (shard, range1) in first {
        if let Some(range2) = second.get(shard) {
            return order_ranges(range1, range2);
        }
    }

    OrderResult::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(!INVALID_EVENT.is_valid());
        assert!(!UNCOMMITTED_EVENT.is_valid());
        assert!(EventId::new(3, 1, 0).is_valid());
    }

    #[test]
    fn same_shard_order() {
        let a = EventId::new(1, 2, 5);
        let b = EventId::new(1, 3, 0);
        let c = EventId::new(1, 2, 6);

        assert_eq!(order_events(&a, &b), OrderResult::OlderThan);
        assert_eq!(order_events(&b, &a), OrderResult::NewerThan);
        assert_eq!(order_events(&a, &c), OrderResult::OlderThan);
        assert_eq!(order_events(&a, &a), OrderResult::Equal);
    }

    #[test]
    fn cross_shard_is_unknown() {
        let a = EventId::new(1, 2, 5);
        let b = EventId::new(2, 2, 5);
        assert_eq!(order_events(&a, &b), OrderResult::Unknown);
    }

    #[test]
    fn range_order() {
        let r1 = EventRange { start_block: 1, end_block: 2, start_index: 0, end_index: 3 };
        let r2 = EventRange { start_block: 3, end_block: 4, start_index: 1, end_index: 0 };
        let r3 = EventRange { start_block: 2, end_block: 3, start_index: 0, end_index: 2 };

        assert_eq!(order_ranges(&r1, &r2), OrderResult::OlderThan);
        assert_eq!(order_ranges(&r2, &r1), OrderResult::NewerThan);
        assert_eq!(order_ranges(&r1, &r3), OrderResult::Concurrent);
    }

    #[test]
    fn bounds_order() {
        let mut b1 = TransactionBounds::new();
        let mut b2 = TransactionBounds::new();
        b1.insert(4, EventRange { start_block: 1, end_block: 1, start_index: 0, end_index: 2 });
        b2.insert(4, EventRange { start_block: 2, end_block: 2, start_index: 0, end_index: 1 });

        assert_eq!(order_bounds(&b1, &b2), OrderResult::OlderThan);
        assert_eq!(order_bounds(&b2, &b1), OrderResult::NewerThan);

        let empty = TransactionBounds::new();
        assert_eq!(order_bounds(&b1, &empty), OrderResult::Unknown);
    }
}
