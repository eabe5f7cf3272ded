//! The enclave root object: one owned value constructed at startup that
//! wires the buffer manager, ledger, transaction machinery, peers and the
//! signing key together. All subsystems take references into it; there
//! are no process-wide singletons.

use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};

use base64::engine::general_purpose;
use base64::Engine as _;

use crate::error::CResult;
use crate::ledger::Ledger;
use crate::page::{BufferManager, PageStore};
use crate::policy::{Identity, IdentityUid, PolicyEvaluator};
use crate::peer::Peers;
use crate::task::TaskManager;
use crate::tx::{TransactionLedger, TransactionManager};
use crate::types::{order_events, EventId, OrderResult};
use crate::witness::Witness;

/// Default in-enclave page cache size.
const DEFAULT_BUFFER_SIZE: usize = 1 << 30;

pub struct Enclave {
    identity: Identity,
    buffer: Arc<BufferManager>,
    ledger: Arc<Ledger>,
    tx_manager: TransactionManager,
    peers: Arc<Peers>,
    tasks: TaskManager,
    signing_key: SigningKey,
}

impl Enclave {
    pub fn new(
        name: &str,
        store: Arc<dyn PageStore>,
        policy: Arc<dyn PolicyEvaluator>,
    ) -> CResult<Self> {
        Self::with_buffer_size(name, store, policy, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        name: &str,
        store: Arc<dyn PageStore>,
        policy: Arc<dyn PolicyEvaluator>,
        buffer_size: usize,
    ) -> CResult<Self> {
        let identity = Identity::server(name);
        let buffer = BufferManager::new(store, name, buffer_size);
        let peers = Arc::new(Peers::new());
        let ledger = Ledger::new(buffer.clone(), policy, peers.clone())?;
        let tx_ledger = Arc::new(TransactionLedger::new(buffer.clone())?);
        let tx_manager = TransactionManager::new(ledger.clone(), tx_ledger);

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

        Ok(Self { identity, buffer, ledger, tx_manager, peers, tasks: TaskManager::new(), signing_key })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn uid(&self) -> IdentityUid {
        self.identity.uid()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    pub fn tx_manager(&self) -> &TransactionManager {
        &self.tx_manager
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The public key clients verify witnesses against. Stable for the
    /// lifetime of the enclave instance.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key().to_bytes())
    }

    /// Build and sign a witness over a list of events.
    pub fn create_witness(&self, events: &[EventId]) -> CResult<Witness> {
        let digest = self.ledger.witness_digest(events)?;
        let mut witness = Witness::from_digest(&digest)?;
        witness.sign(&self.signing_key)?;
        Ok(witness)
    }

    /// Order two events, consulting the transaction ledger when they live
    /// on different shards.
    pub fn order_events(&self, first: &EventId, second: &EventId) -> CResult<OrderResult> {
        let local = order_events(first, second);
        if local != OrderResult::Unknown {
            return Ok(local);
        }

        let handle = self.ledger.handle();
        let event_a = self.ledger().get_event(first, &handle, crate::sync::LockType::Read)?;
        let event_b = self.ledger().get_event(second, &handle, crate::sync::LockType::Read)?;

        let (ref_a, ref_b) = match (event_a.tx_ref, event_b.tx_ref) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(OrderResult::Unknown),
        };

        let entry_a = self.tx_manager.tx_ledger().get(ref_a)?;
        let entry_b = self.tx_manager.tx_ledger().get(ref_b)?;
        Ok(crate::types::order_bounds(&entry_a.bounds(), &entry_b.bounds()))
    }

    /// A peer's link dropped: forget it, drop its triggers and abort any
    /// in-flight transaction it coordinates.
    pub fn handle_peer_disconnect(&self, uid: IdentityUid) {
        self.peers.remove(uid);
        self.ledger.remove_triggers_for(uid);
        self.tx_manager.abort_for_root(uid);
        log::info!("peer {} disconnected", uid);
    }

    /// Flush everything and fail outstanding waiters.
    pub fn shutdown(&self) -> CResult<()> {
        self.tasks.fail_all("enclave shutting down");
        self.buffer.flush_all_pages()?;
        self.buffer.clear_cache()?;
        log::info!("enclave '{}' shut down", self.identity.name);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::page::MemoryStore;
    use crate::policy::AllowAll;

    pub(crate) fn test_enclave() -> CResult<Enclave> {
        Enclave::with_buffer_size(
            "test_enclave",
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            1 << 24,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_enclave;
    use super::*;
    use crate::ledger::tests::test_context;
    use serde_json::json;

    const COLLECTION: &str = "test";

    #[test]
    fn witness_over_events_verifies() -> CResult<()> {
        let enclave = test_enclave()?;
        let ctx = test_context();

        let eid = enclave.ledger().put(&ctx, COLLECTION, "foo", &json!({"a": 1}), "", None)?;
        let witness = enclave.create_witness(&[eid])?;

        assert!(witness.valid(&enclave.public_key()));
        assert!(witness.is_valid(&enclave.public_key_base64())?);

        // armor round trip preserves validity
        let parsed = Witness::from_armor(&witness.armor()?)?;
        assert!(parsed.valid(&enclave.public_key()));
        Ok(())
    }

    #[test]
    fn same_shard_events_order_locally() -> CResult<()> {
        let enclave = test_enclave()?;
        let ctx = test_context();

        let first = enclave.ledger().put(&ctx, COLLECTION, "foo", &json!(1), "", None)?;
        let second = enclave.ledger().put(&ctx, COLLECTION, "foo", &json!(2), "", None)?;

        assert_eq!(enclave.order_events(&first, &second)?, OrderResult::OlderThan);
        assert_eq!(enclave.order_events(&second, &first)?, OrderResult::NewerThan);
        assert_eq!(enclave.order_events(&first, &first)?, OrderResult::Equal);
        Ok(())
    }

    #[test]
    fn cross_shard_order_unknown_without_transactions() -> CResult<()> {
        let enclave = test_enclave()?;
        let ctx = test_context();

        // Find two keys on different shards.
        let ledger = enclave.ledger();
        let mut eids = Vec::new();
        for i in 0..20 {
            let key = format!("k{}", i);
            let eid = ledger.put(&ctx, COLLECTION, &key, &json!(i), "", None)?;
            eids.push(eid);
        }
        let a = eids[0];
        let b = match eids.iter().find(|eid| eid.shard != a.shard) {
            Some(b) => *b,
            None => return Ok(()), // extraordinarily unlucky hashing
        };

        assert_eq!(enclave.order_events(&a, &b)?, OrderResult::Unknown);
        Ok(())
    }
}
