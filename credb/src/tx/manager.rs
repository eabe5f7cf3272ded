//! Registry of in-flight transactions, keyed by (root identity, local
//! transaction id). Remote children live here between the coordinator's
//! Prepare and Commit/Abort messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::ledger::Ledger;
use crate::policy::IdentityUid;
use crate::types::TransactionId;

use super::transaction::Transaction;
use super::tx_ledger::TransactionLedger;
use super::IsolationLevel;

pub struct TransactionManager {
    ledger: Arc<Ledger>,
    tx_ledger: Arc<TransactionLedger>,
    transactions: Mutex<HashMap<(IdentityUid, TransactionId), Arc<Mutex<Transaction>>>>,
    next_id: AtomicU32,
}

impl TransactionManager {
    pub fn new(ledger: Arc<Ledger>, tx_ledger: Arc<TransactionLedger>) -> Self {
        Self {
            ledger,
            tx_ledger,
            transactions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn tx_ledger(&self) -> &Arc<TransactionLedger> {
        &self.tx_ledger
    }

    /// Start a transaction rooted at this node.
    pub fn init_local(
        &self,
        isolation: IsolationLevel,
        root: IdentityUid,
    ) -> (TransactionId, Arc<Mutex<Transaction>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tx = Arc::new(Mutex::new(Transaction::new(
            self.ledger.clone(),
            self.tx_ledger.clone(),
            isolation,
            root,
            id,
            false,
        )));

        self.transactions.lock().unwrap().insert((root, id), tx.clone());
        (id, tx)
    }

    /// Register a child transaction initiated by a remote coordinator.
    pub fn init_remote(
        &self,
        isolation: IsolationLevel,
        root: IdentityUid,
        id: TransactionId,
    ) -> Arc<Mutex<Transaction>> {
        let tx = Arc::new(Mutex::new(Transaction::new(
            self.ledger.clone(),
            self.tx_ledger.clone(),
            isolation,
            root,
            id,
            true,
        )));

        self.transactions.lock().unwrap().insert((root, id), tx.clone());
        tx
    }

    pub fn get(&self, root: IdentityUid, id: TransactionId) -> CResult<Arc<Mutex<Transaction>>> {
        self.transactions
            .lock()
            .unwrap()
            .get(&(root, id))
            .cloned()
            .ok_or_else(|| Error::TransactionAborted(format!("no such transaction ({}, {})", root, id)))
    }

    pub fn remove(&self, root: IdentityUid, id: TransactionId) {
        self.transactions.lock().unwrap().remove(&(root, id));
    }

    pub fn num_pending(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    /// Abort every in-flight transaction rooted at a peer whose link
    /// dropped.
    pub fn abort_for_root(&self, root: IdentityUid) {
        let doomed: Vec<_> = {
            let transactions = self.transactions.lock().unwrap();
            transactions
                .iter()
                .filter(|((r, _), _)| *r == root)
                .map(|(key, tx)| (*key, tx.clone()))
                .collect()
        };

        for ((root, id), tx) in doomed {
            tx.lock().unwrap().abort();
            self.remove(root, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::test_ledger;
    use crate::tx::TransactionState;

    fn setup() -> CResult<TransactionManager> {
        let ledger = test_ledger()?;
        let tx_ledger = Arc::new(TransactionLedger::new(ledger.buffer().clone())?);
        Ok(TransactionManager::new(ledger, tx_ledger))
    }

    #[test]
    fn local_ids_are_unique() -> CResult<()> {
        let manager = setup()?;
        let (id1, _) = manager.init_local(IsolationLevel::ReadCommitted, 7);
        let (id2, _) = manager.init_local(IsolationLevel::ReadCommitted, 7);
        assert_ne!(id1, id2);
        assert_eq!(manager.num_pending(), 2);
        Ok(())
    }

    #[test]
    fn lookup_and_remove() -> CResult<()> {
        let manager = setup()?;
        let (id, _) = manager.init_local(IsolationLevel::Serializable, 7);

        assert!(manager.get(7, id).is_ok());
        manager.remove(7, id);
        assert!(manager.get(7, id).is_err());
        Ok(())
    }

    #[test]
    fn link_drop_aborts_in_flight_children() -> CResult<()> {
        let manager = setup()?;
        let tx = manager.init_remote(IsolationLevel::ReadCommitted, 42, 3);
        let other = manager.init_remote(IsolationLevel::ReadCommitted, 43, 1);

        manager.abort_for_root(42);
        assert_eq!(tx.lock().unwrap().state(), TransactionState::Aborted);
        assert!(manager.get(42, 3).is_err());
        // unrelated roots are untouched
        assert!(manager.get(43, 1).is_ok());
        drop(other);
        Ok(())
    }
}
