//! The operation surface: decoded requests in, responses (plus optional
//! witnesses) out. Attestation and message framing happen before a
//! request reaches this point; handlers only see the decoded request and
//! the caller's operation context.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::doc;
use crate::enclave::Enclave;
use crate::error::{CResult, Error};
use crate::policy::{IdentityUid, OpContext};
use crate::peer::{PeerMessage, PeerResponse};
use crate::tx::op::{AddOp, CheckOp, FindOp, GetOp, HasOp, PutOp, RemoveOp};
use crate::tx::{IsolationLevel, TransactionCoordinator};
use crate::types::{EventId, OrderResult, TransactionId, VersionNo};
use crate::witness::Witness;

/// Operations inside an ExecuteTransaction request, in execution order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransactionOp {
    Get { collection: String, key: String, expected: EventId },
    Has { collection: String, key: String, expected: bool },
    Check { collection: String, key: String, predicate: Value, expected: bool },
    Put { collection: String, key: String, document: Value },
    Add { collection: String, key: String, delta: Value },
    Remove { collection: String, key: String },
    Find { collection: String, predicates: Value, projection: Vec<String>, limit: Option<usize> },
}

/// The opcodes clients and peers invoke.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    GetObject { collection: String, key: String, generate_witness: bool },
    HasObject { collection: String, key: String },
    CheckObject { collection: String, key: String, predicate: Value },
    PutObject { collection: String, key: String, document: Value },
    PutObjectWithoutKey { collection: String, document: Value },
    AddToObject { collection: String, key: String, delta: Value },
    RemoveObject { collection: String, key: String },
    GetObjectHistory { collection: String, key: String },
    FindObjects { collection: String, predicates: Value, projection: Vec<String>, limit: Option<usize> },
    CountObjects { collection: String, predicates: Value },
    CreateIndex { collection: String, name: String, paths: Vec<String> },
    DropIndex { collection: String, name: String },
    Clear { collection: String },
    DiffVersions { collection: String, key: String, version1: VersionNo, version2: VersionNo },
    ExecuteTransaction { isolation: IsolationLevel, generate_witness: bool, ops: Vec<TransactionOp> },
    TransactionPrepare { root: IdentityUid, tx_id: TransactionId, generate_witness: bool },
    TransactionCommit { root: IdentityUid, tx_id: TransactionId, generate_witness: bool },
    TransactionAbort { root: IdentityUid, tx_id: TransactionId },
    OrderEvents { first: EventId, second: EventId },
    CreateWitness { events: Vec<EventId> },
    SetTrigger { collection: String },
    UnsetTrigger { collection: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Value { event: EventId, value: Value },
    Event(EventId),
    GeneratedKey { event: EventId, key: String },
    Bool(bool),
    History(Vec<Value>),
    Objects(Vec<(String, Value)>),
    Count(u32),
    Diff(Value),
    Order(OrderResult),
    TxCommitted(bool),
    NotFound,
}

/// Dispatch one decoded request. Returns the response and, where the
/// opcode asks for one, a witness.
pub fn handle(
    enclave: &Enclave,
    op_context: &OpContext,
    request: Request,
) -> CResult<(Response, Option<Witness>)> {
    let ledger = enclave.ledger();

    match request {
        Request::GetObject { collection, key, generate_witness } => {
            let (object_key, path) = doc::split_path(&key);
            match ledger.get(op_context, &collection, object_key, path, None)? {
                Some((event, value)) => {
                    let witness = if generate_witness {
                        Some(enclave.create_witness(&[event])?)
                    } else {
                        None
                    };
                    Ok((Response::Value { event, value }, witness))
                }
                None => Ok((Response::NotFound, None)),
            }
        }

        Request::HasObject { collection, key } => {
            Ok((Response::Bool(ledger.has_object(&collection, &key)?), None))
        }

        Request::CheckObject { collection, key, predicate } => {
            let (object_key, path) = doc::split_path(&key);
            let result = ledger.check(op_context, &collection, object_key, path, &predicate, None)?;
            Ok((Response::Bool(result), None))
        }

        Request::PutObject { collection, key, document } => {
            let (object_key, path) = doc::split_path(&key);
            let event = ledger.put(op_context, &collection, object_key, &document, path, None)?;
            Ok((Response::Event(event), None))
        }

        Request::PutObjectWithoutKey { collection, document } => {
            let (event, key) = ledger.put_without_key(op_context, &collection, &document, None)?;
            Ok((Response::GeneratedKey { event, key }, None))
        }

        Request::AddToObject { collection, key, delta } => {
            let (object_key, path) = doc::split_path(&key);
            let event = ledger.add(op_context, &collection, object_key, &delta, path, None)?;
            Ok((Response::Event(event), None))
        }

        Request::RemoveObject { collection, key } => {
            let event = ledger.remove(op_context, &collection, &key, None)?;
            Ok((Response::Event(event), None))
        }

        Request::GetObjectHistory { collection, key } => {
            let mut iter = ledger.iterate(op_context, &collection, &key, "", None);
            let mut versions = Vec::new();
            while let Some((_, value)) = iter.next()? {
                versions.push(value);
            }
            Ok((Response::History(versions), None))
        }

        Request::FindObjects { collection, predicates, projection, limit } => {
            let mut iter = ledger.find(op_context, &collection, predicates, limit, None)?;
            let mut objects = Vec::new();
            while let Some((key, _, value)) = iter.next_entry()? {
                let value = if projection.is_empty() {
                    value
                } else {
                    doc::project(&value, &projection)
                };
                objects.push((key, value));
            }
            Ok((Response::Objects(objects), None))
        }

        Request::CountObjects { collection, predicates } => {
            Ok((Response::Count(ledger.count_objects(op_context, &collection, predicates)?), None))
        }

        Request::CreateIndex { collection, name, paths } => {
            Ok((Response::Bool(ledger.create_index(&collection, &name, paths)?), None))
        }

        Request::DropIndex { collection, name } => {
            Ok((Response::Bool(ledger.drop_index(&collection, &name)?), None))
        }

        Request::Clear { collection } => {
            Ok((Response::Bool(ledger.clear(op_context, &collection)?), None))
        }

        Request::DiffVersions { collection, key, version1, version2 } => {
            match ledger.diff(op_context, &collection, &key, version1, version2)? {
                Some(diff) => Ok((Response::Diff(diff), None)),
                None => Ok((Response::NotFound, None)),
            }
        }

        Request::ExecuteTransaction { isolation, generate_witness, ops } => {
            execute_transaction(enclave, op_context, isolation, generate_witness, ops)
        }

        Request::TransactionPrepare { root, tx_id, generate_witness } => {
            let tx = enclave.tx_manager().get(root, tx_id)?;
            let result = tx.lock().unwrap().prepare(generate_witness);
            match result {
                Ok(()) => Ok((Response::Bool(true), None)),
                Err(_) => {
                    enclave.tx_manager().remove(root, tx_id);
                    Ok((Response::Bool(false), None))
                }
            }
        }

        Request::TransactionCommit { root, tx_id, generate_witness } => {
            let tx = enclave.tx_manager().get(root, tx_id)?;
            let digest = tx.lock().unwrap().commit()?;
            enclave.tx_manager().remove(root, tx_id);

            let witness = match (generate_witness, digest) {
                (true, Some(digest)) => {
                    let mut witness = Witness::from_digest(&digest)?;
                    witness.sign(enclave.signing_key())?;
                    Some(witness)
                }
                _ => None,
            };
            Ok((Response::TxCommitted(true), witness))
        }

        Request::TransactionAbort { root, tx_id } => {
            let tx = enclave.tx_manager().get(root, tx_id)?;
            tx.lock().unwrap().abort();
            enclave.tx_manager().remove(root, tx_id);
            Ok((Response::Bool(true), None))
        }

        Request::OrderEvents { first, second } => {
            Ok((Response::Order(enclave.order_events(&first, &second)?), None))
        }

        Request::CreateWitness { events } => {
            let witness = enclave.create_witness(&events)?;
            Ok((Response::Bool(true), Some(witness)))
        }

        Request::SetTrigger { collection } => {
            let party = caller_uid(op_context)?;
            Ok((Response::Bool(ledger.set_trigger(&collection, party)), None))
        }

        Request::UnsetTrigger { collection } => {
            let party = caller_uid(op_context)?;
            Ok((Response::Bool(ledger.unset_trigger(&collection, party)), None))
        }
    }
}

fn caller_uid(op_context: &OpContext) -> CResult<IdentityUid> {
    op_context
        .identity()
        .map(|identity| identity.uid())
        .ok_or_else(|| Error::InvalidArgument("trigger registration needs an identity".into()))
}

fn execute_transaction(
    enclave: &Enclave,
    op_context: &OpContext,
    isolation: IsolationLevel,
    generate_witness: bool,
    ops: Vec<TransactionOp>,
) -> CResult<(Response, Option<Witness>)> {
    let ledger = enclave.ledger();
    let (_, tx) = enclave.tx_manager().init_local(isolation, enclave.uid());

    {
        let mut tx = tx.lock().unwrap();
        for (task, op) in ops.into_iter().enumerate() {
            let task = task as u64;
            match op {
                TransactionOp::Get { collection, key, expected } => tx.register(
                    task,
                    op_context,
                    Box::new(GetOp::new(ledger, op_context.clone(), &collection, &key, expected)),
                ),
                TransactionOp::Has { collection, key, expected } => tx.register(
                    task,
                    op_context,
                    Box::new(HasOp::new(ledger, &collection, &key, expected)),
                ),
                TransactionOp::Check { collection, key, predicate, expected } => {
                    let (object_key, path) = doc::split_path(&key);
                    tx.register(
                        task,
                        op_context,
                        Box::new(CheckOp::new(
                            ledger,
                            op_context.clone(),
                            &collection,
                            object_key,
                            path,
                            predicate,
                            expected,
                        )),
                    )
                }
                TransactionOp::Put { collection, key, document } => tx.register(
                    task,
                    op_context,
                    Box::new(PutOp::new(ledger, op_context.clone(), &collection, &key, document)),
                ),
                TransactionOp::Add { collection, key, delta } => tx.register(
                    task,
                    op_context,
                    Box::new(AddOp::new(ledger, op_context.clone(), &collection, &key, delta)),
                ),
                TransactionOp::Remove { collection, key } => tx.register(
                    task,
                    op_context,
                    Box::new(RemoveOp::new(ledger, op_context.clone(), &collection, &key)),
                ),
                TransactionOp::Find { collection, predicates, projection, limit } => tx.register(
                    task,
                    op_context,
                    Box::new(FindOp::record(
                        ledger,
                        op_context.clone(),
                        &collection,
                        predicates,
                        projection,
                        limit,
                    )?),
                ),
            }
        }
    }

    let witness = TransactionCoordinator::execute(
        &tx,
        enclave.peers(),
        enclave.tx_manager(),
        generate_witness,
        enclave.signing_key(),
    )?;

    Ok((Response::TxCommitted(true), witness))
}

/// Dispatch a message arriving from a peer rather than a client.
pub fn handle_peer_message(enclave: &Enclave, message: PeerMessage) -> CResult<PeerResponse> {
    match message {
        PeerMessage::TransactionPrepare { root, tx_id, generate_witness } => {
            let tx = enclave.tx_manager().get(root, tx_id)?;
            let result = tx.lock().unwrap().prepare(generate_witness);
            match result {
                Ok(()) => Ok(PeerResponse::Ack(true)),
                Err(_) => {
                    enclave.tx_manager().remove(root, tx_id);
                    Ok(PeerResponse::Ack(false))
                }
            }
        }

        PeerMessage::TransactionCommit { root, tx_id, generate_witness } => {
            let tx = enclave.tx_manager().get(root, tx_id)?;
            let digest = tx.lock().unwrap().commit()?;
            enclave.tx_manager().remove(root, tx_id);

            let witness = match (generate_witness, digest) {
                (true, Some(digest)) => {
                    let mut witness = Witness::from_digest(&digest)?;
                    witness.sign(enclave.signing_key())?;
                    Some(witness)
                }
                _ => None,
            };
            Ok(PeerResponse::CommitResult { success: true, witness })
        }

        PeerMessage::TransactionAbort { root, tx_id } => {
            if let Ok(tx) = enclave.tx_manager().get(root, tx_id) {
                tx.lock().unwrap().abort();
                enclave.tx_manager().remove(root, tx_id);
            }
            Ok(PeerResponse::Ack(true))
        }

        PeerMessage::PushIndexUpdate(update) => {
            enclave.ledger().apply_index_update(&update)?;
            Ok(PeerResponse::Ack(true))
        }

        PeerMessage::ReadFromUpstreamDisk { name } => {
            Ok(PeerResponse::Page(enclave.buffer().store().read(&name)?))
        }

        PeerMessage::NotifyTrigger { collection } => {
            log::debug!("trigger notification for collection '{}'", collection);
            Ok(PeerResponse::Ack(true))
        }
    }
}
