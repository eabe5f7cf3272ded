//! The peer RPC surface the core consumes.
//!
//! Socket management and message framing live outside the core; what the
//! core sees is a registry of attested peers it can send transaction
//! control, index updates and trigger notifications to. Every message
//! carries a task id so the transport can resume the waiting task when
//! the response arrives.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::index::IndexChange;
use crate::policy::IdentityUid;
use crate::types::{BlockIndex, PageNo, ShardId, TransactionId};
use crate::witness::Witness;

/// An index mutation pushed from an upstream node to its downstream
/// replicas, together with the data block page the write invalidated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexUpdate {
    pub collection: String,
    pub changes: Vec<IndexChange>,
    pub shard: ShardId,

    /// Page of the data block the write went into, or `INVALID_PAGE_NO`.
    pub invalidated_page: PageNo,

    /// Entry count of that block after the write, so the replica can wait
    /// for the page to catch up.
    pub pending_entries: BlockIndex,
}

/// Messages the core exchanges with peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Phase one of two-phase commit.
    TransactionPrepare { root: IdentityUid, tx_id: TransactionId, generate_witness: bool },

    /// Phase two; the child applies its writes.
    TransactionCommit { root: IdentityUid, tx_id: TransactionId, generate_witness: bool },

    /// Roll the child's half of the transaction back.
    TransactionAbort { root: IdentityUid, tx_id: TransactionId },

    /// Upstream -> downstream index mutation.
    PushIndexUpdate(IndexUpdate),

    /// Downstream -> upstream page fetch, by page name.
    ReadFromUpstreamDisk { name: String },

    /// Forwarded mutation notification for trigger subscribers.
    NotifyTrigger { collection: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerResponse {
    Ack(bool),
    CommitResult { success: bool, witness: Option<Witness> },
    Page(Option<Vec<u8>>),
}

/// A live link to one attested peer.
///
/// `call` blocks the calling task until the peer responds; the transport
/// is responsible for suspending the task and resuming it by id when the
/// response message arrives. `send` is fire-and-forget.
pub trait PeerLink: Send + Sync {
    fn uid(&self) -> IdentityUid;

    fn call(&self, message: PeerMessage) -> CResult<PeerResponse>;

    fn send(&self, message: PeerMessage) -> CResult<()>;
}

/// Registry of connected peers, plus which of them are downstream
/// replicas of this node.
pub struct Peers {
    links: RwLock<HashMap<IdentityUid, Arc<dyn PeerLink>>>,
    downstream: RwLock<HashSet<IdentityUid>>,
}

impl Peers {
    pub fn new() -> Self {
        Self { links: RwLock::new(HashMap::new()), downstream: RwLock::new(HashSet::new()) }
    }

    pub fn add(&self, link: Arc<dyn PeerLink>) {
        self.links.write().unwrap().insert(link.uid(), link);
    }

    /// Drop a peer, e.g. when its link goes down. In-flight distributed
    /// transactions with this child abort when their next call fails.
    pub fn remove(&self, uid: IdentityUid) {
        self.links.write().unwrap().remove(&uid);
        self.downstream.write().unwrap().remove(&uid);
    }

    pub fn find(&self, uid: IdentityUid) -> Option<Arc<dyn PeerLink>> {
        self.links.read().unwrap().get(&uid).cloned()
    }

    pub fn require(&self, uid: IdentityUid) -> CResult<Arc<dyn PeerLink>> {
        self.find(uid)
            .ok_or_else(|| Error::TransactionAborted(format!("no link to peer {}", uid)))
    }

    pub fn set_downstream(&self, uid: IdentityUid) {
        self.downstream.write().unwrap().insert(uid);
    }

    pub fn downstream_set(&self) -> Vec<IdentityUid> {
        self.downstream.read().unwrap().iter().copied().collect()
    }

    /// Forward an index update to every downstream replica.
    pub fn push_index_update(&self, update: &IndexUpdate) {
        for uid in self.downstream_set() {
            match self.find(uid) {
                Some(link) => {
                    if let Err(err) = link.send(PeerMessage::PushIndexUpdate(update.clone())) {
                        log::error!("failed to push index update to peer {}: {}", uid, err);
                    }
                }
                None => log::error!("unable to find downstream peer {}", uid),
            }
        }
    }

    /// Notify a trigger subscriber that a collection changed.
    pub fn notify_trigger(&self, party: IdentityUid, collection: &str) {
        if let Some(link) = self.find(party) {
            if let Err(err) =
                link.send(PeerMessage::NotifyTrigger { collection: collection.to_string() })
            {
                log::warn!("trigger notification to {} failed: {}", party, err);
            }
        }
    }
}

impl Default for Peers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A peer that records what it was sent and answers from a script.
    pub struct RecordingPeer {
        uid: IdentityUid,
        pub sent: Mutex<Vec<PeerMessage>>,
        pub responses: Mutex<Vec<PeerResponse>>,
    }

    impl RecordingPeer {
        pub fn new(uid: IdentityUid) -> Self {
            Self { uid, sent: Mutex::new(Vec::new()), responses: Mutex::new(Vec::new()) }
        }
    }

    impl PeerLink for RecordingPeer {
        fn uid(&self) -> IdentityUid {
            self.uid
        }

        fn call(&self, message: PeerMessage) -> CResult<PeerResponse> {
            self.sent.lock().unwrap().push(message);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::TransactionAborted("peer link dropped".into()))
        }

        fn send(&self, message: PeerMessage) -> CResult<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }
}
