//! The transaction engine: isolation levels, per-opcode operation
//! records, prepare/commit/abort, the transaction ledger and two-phase
//! commit across peers.

pub mod coordinator;
pub mod manager;
pub mod op;
pub mod transaction;
pub mod tx_ledger;

use serde_derive::{Deserialize, Serialize};

use crate::types::EventId;

pub use coordinator::TransactionCoordinator;
pub use manager::TransactionManager;
pub use op::{Operation, TxContext};
pub use transaction::Transaction;
pub use tx_ledger::{TransactionEntry, TransactionLedger};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "ReadCommitted",
            IsolationLevel::RepeatableRead => "RepeatableRead",
            IsolationLevel::Serializable => "Serializable",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Pending,
    Prepared,
    Committed,
    Aborted,
}

/// The events a transaction read and wrote, recorded in its ledger entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpSet {
    pub reads: Vec<EventId>,
    pub writes: Vec<EventId>,
}
