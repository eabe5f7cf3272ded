//! Two-phase commit across peers.
//!
//! The coordinator drives phase one (Prepare on every child, then
//! locally), aborts everything on any failure, and in phase two commits
//! locally, commits the children, merges their witness fragments into the
//! composite and signs it once at the end.

use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use serde_json::Value;

use crate::error::{CResult, Error};
use crate::peer::{PeerMessage, PeerResponse, Peers};
use crate::witness::{Witness, OP_FIELD_NAME};

use super::manager::TransactionManager;
use super::transaction::Transaction;

pub struct TransactionCoordinator;

impl TransactionCoordinator {
    /// Run a transaction to completion: prepare (distributed if it has
    /// children), commit, witness. The transaction is removed from the
    /// manager either way.
    pub fn execute(
        tx: &Arc<Mutex<Transaction>>,
        peers: &Peers,
        manager: &TransactionManager,
        generate_witness: bool,
        signing_key: &SigningKey,
    ) -> CResult<Option<Witness>> {
        let mut tx = tx.lock().unwrap();
        let children: Vec<_> = tx.children().collect();
        let (root, id) = (tx.root(), tx.id());

        // ---- Phase one: prepare -------------------------------------
        let mut failure: Option<String> = None;

        for child in &children {
            let result = peers.require(*child).and_then(|link| {
                link.call(PeerMessage::TransactionPrepare { root, tx_id: id, generate_witness })
            });

            match result {
                Ok(PeerResponse::Ack(true)) => {}
                Ok(_) => {
                    failure = Some(format!("child peer {} failed to prepare", child));
                    break;
                }
                Err(err) => {
                    failure = Some(format!("child peer {} unreachable: {}", child, err));
                    break;
                }
            }
        }

        if failure.is_none() {
            if let Err(err) = tx.prepare(generate_witness) {
                failure = Some(err.to_string());
            }
        }

        if let Some(reason) = failure {
            // Fire-and-forget aborts; unreachable children clean up when
            // their link drops.
            for child in &children {
                if let Some(link) = peers.find(*child) {
                    let _ = link.send(PeerMessage::TransactionAbort { root, tx_id: id });
                }
            }

            tx.abort();
            manager.remove(root, id);
            return Err(Error::TransactionAborted(reason));
        }

        // ---- Phase two: commit --------------------------------------
        let local_digest = match tx.commit() {
            Ok(digest) => digest,
            Err(err) => {
                manager.remove(root, id);
                return Err(err);
            }
        };
        manager.remove(root, id);

        let mut composite = local_digest;

        for child in &children {
            let result = peers.require(*child).and_then(|link| {
                link.call(PeerMessage::TransactionCommit { root, tx_id: id, generate_witness })
            });

            match result {
                Ok(PeerResponse::CommitResult { success: true, witness }) => {
                    if generate_witness {
                        match witness {
                            Some(witness) => merge_digest(&mut composite, &witness)?,
                            None => log::warn!(
                                "child peer {} committed without a witness",
                                child
                            ),
                        }
                    }
                }
                Ok(_) | Err(_) => {
                    // The local commit stands; the data-plane outcome is
                    // the same, only the witness is incomplete.
                    log::warn!(
                        "child peer {} did not confirm commit; witness may be incomplete",
                        child
                    );
                }
            }
        }

        match composite {
            Some(digest) => {
                let mut witness = Witness::from_digest(&digest)?;
                if let Err(err) = witness.sign(signing_key) {
                    // The writes are already applied; surface the commit
                    // without a witness.
                    log::error!("failed to sign witness: {}", err);
                    return Ok(None);
                }
                Ok(Some(witness))
            }
            None => Ok(None),
        }
    }
}

/// Append a child witness's operation records to the composite digest.
fn merge_digest(composite: &mut Option<Value>, child: &Witness) -> CResult<()> {
    let child_digest = child.digest()?;
    let child_ops = match child_digest.get(OP_FIELD_NAME).and_then(|ops| ops.as_array()) {
        Some(ops) => ops.clone(),
        None => return Ok(()),
    };

    if let Some(Value::Object(map)) = composite {
        match map.get_mut(OP_FIELD_NAME) {
            Some(Value::Array(ops)) => ops.extend(child_ops),
            _ => {
                map.insert(OP_FIELD_NAME.to_string(), Value::Array(child_ops));
            }
        }
    }
    Ok(())
}
