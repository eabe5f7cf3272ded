//! End-to-end scenarios against the full operation surface.

use std::sync::Arc;

use serde_json::{json, Value};

use credb::enclave::Enclave;
use credb::error::CResult;
use credb::page::{EncryptedStore, FileStore, MemoryStore};
use credb::policy::{AllowAll, Identity, OpContext, PolicyBindings, PolicyEvaluator};
use credb::protocol::{handle, Request, Response};
use credb::types::EventId;

const COLLECTION: &str = "test";

fn test_enclave() -> CResult<Enclave> {
    Enclave::with_buffer_size(
        "test_enclave",
        Arc::new(MemoryStore::new()),
        Arc::new(AllowAll),
        1 << 24,
    )
}

fn client(name: &str) -> OpContext {
    OpContext::new(Identity::client(name))
}

fn put(enclave: &Enclave, ctx: &OpContext, key: &str, document: Value) -> CResult<EventId> {
    let (response, _) = handle(
        enclave,
        ctx,
        Request::PutObject { collection: COLLECTION.into(), key: key.into(), document },
    )?;
    match response {
        Response::Event(eid) => Ok(eid),
        other => panic!("unexpected response: {:?}", other),
    }
}

fn get(enclave: &Enclave, ctx: &OpContext, key: &str) -> CResult<Option<(EventId, Value)>> {
    let (response, _) = handle(
        enclave,
        ctx,
        Request::GetObject {
            collection: COLLECTION.into(),
            key: key.into(),
            generate_witness: false,
        },
    )?;
    match response {
        Response::Value { event, value } => Ok(Some((event, value))),
        Response::NotFound => Ok(None),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn simple_put_get() -> CResult<()> {
    let enclave = test_enclave()?;
    let ctx = client("tester");

    let eid = put(&enclave, &ctx, "foo", json!({"a": 42}))?;
    let (got, value) = get(&enclave, &ctx, "foo")?.unwrap();

    assert_eq!(value, json!({"a": 42}));
    assert_eq!(got, eid);
    // first operation ever: index 0 of the shard's first block
    assert_eq!(eid.index, 0);
    assert_eq!(eid.shard, enclave.ledger().shard_of(COLLECTION, "foo"));
    Ok(())
}

#[test]
fn path_updates_build_arrays() -> CResult<()> {
    let enclave = test_enclave()?;
    let ctx = client("tester");

    put(&enclave, &ctx, "foo", json!({}))?;
    handle(
        &enclave,
        &ctx,
        Request::PutObject {
            collection: COLLECTION.into(),
            key: "foo.xyz.+".into(),
            document: json!(1),
        },
    )?;
    handle(
        &enclave,
        &ctx,
        Request::PutObject {
            collection: COLLECTION.into(),
            key: "foo.xyz.+".into(),
            document: json!(2),
        },
    )?;

    let (_, value) = get(&enclave, &ctx, "foo")?.unwrap();
    assert_eq!(value, json!({"xyz": [1, 2]}));
    Ok(())
}

#[test]
fn remove_then_recount() -> CResult<()> {
    let enclave = test_enclave()?;
    let ctx = client("tester");

    put(&enclave, &ctx, "k1", json!({"x": 1}))?;
    put(&enclave, &ctx, "k2", json!({"x": 2}))?;

    handle(&enclave, &ctx, Request::RemoveObject { collection: COLLECTION.into(), key: "k1".into() })?;

    let (response, _) = handle(
        &enclave,
        &ctx,
        Request::CountObjects { collection: COLLECTION.into(), predicates: json!({}) },
    )?;
    assert_eq!(response, Response::Count(1));
    Ok(())
}

#[test]
fn find_with_in_over_covered_index() -> CResult<()> {
    let enclave = test_enclave()?;
    let ctx = client("tester");

    let (response, _) = handle(
        &enclave,
        &ctx,
        Request::CreateIndex {
            collection: COLLECTION.into(),
            name: "idx".into(),
            paths: vec!["b".into()],
        },
    )?;
    assert_eq!(response, Response::Bool(true));

    put(&enclave, &ctx, "k1", json!({"a": 42, "b": 23}))?;
    put(&enclave, &ctx, "k2", json!({"a": 43, "b": 23}))?;

    let (response, _) = handle(
        &enclave,
        &ctx,
        Request::FindObjects {
            collection: COLLECTION.into(),
            predicates: json!({"b": {"$in": [21, 22, 23]}}),
            projection: vec![],
            limit: None,
        },
    )?;

    match response {
        Response::Objects(mut objects) => {
            objects.sort_by(|a, b| a.0.cmp(&b.0));
            let keys: Vec<_> = objects.iter().map(|(key, _)| key.as_str()).collect();
            assert_eq!(keys, vec!["k1", "k2"]);
        }
        other => panic!("unexpected response: {:?}", other),
    }
    Ok(())
}

#[test]
fn secondary_index_agrees_with_linear_scan() -> CResult<()> {
    // The same predicate must select the same keys whether or not an
    // index covers it.
    let indexed = test_enclave()?;
    let plain = test_enclave()?;
    let ctx = client("tester");

    handle(
        &indexed,
        &ctx,
        Request::CreateIndex {
            collection: COLLECTION.into(),
            name: "idx".into(),
            paths: vec!["b".into()],
        },
    )?;

    for enclave in [&indexed, &plain] {
        put(enclave, &ctx, "k1", json!({"b": 1}))?;
        put(enclave, &ctx, "k2", json!({"b": 2}))?;
        put(enclave, &ctx, "k2", json!({"b": 3}))?; // moves out of b=2
        put(enclave, &ctx, "k3", json!({"c": 9}))?; // no b at all
    }

    for predicate in [json!({"b": 2}), json!({"b": 3}), json!({"b": {"$in": [1, 3]}})] {
        let mut results = Vec::new();
        for enclave in [&indexed, &plain] {
            let (response, _) = handle(
                enclave,
                &ctx,
                Request::FindObjects {
                    collection: COLLECTION.into(),
                    predicates: predicate.clone(),
                    projection: vec![],
                    limit: None,
                },
            )?;
            match response {
                Response::Objects(mut objects) => {
                    objects.sort_by(|a, b| a.0.cmp(&b.0));
                    results.push(objects);
                }
                other => panic!("unexpected response: {:?}", other),
            }
        }
        assert_eq!(results[0], results[1], "divergence for predicate {}", predicate);
    }
    Ok(())
}

/// Rejects writes guarded by the program `"deny-jondoe"` whenever the
/// calling identity is named jondoe.
struct DenyJondoe;

impl PolicyEvaluator for DenyJondoe {
    fn evaluate(&self, program: &Value, bindings: &PolicyBindings<'_>) -> CResult<bool> {
        if program == &json!("deny-jondoe") {
            let name = bindings.op_context.identity().map(|identity| identity.name.as_str());
            return Ok(name != Some("jondoe"));
        }
        Ok(true)
    }
}

#[test]
fn object_policy_gates_by_identity() -> CResult<()> {
    let enclave = Enclave::with_buffer_size(
        "test_enclave",
        Arc::new(MemoryStore::new()),
        Arc::new(DenyJondoe),
        1 << 24,
    )?;
    let alice = client("alice");
    let jondoe = client("jondoe");

    put(&enclave, &alice, "foo", json!({"value": 1, "policy": "deny-jondoe"}))?;

    // jondoe cannot update the object; the put yields the invalid event.
    let eid = put(&enclave, &jondoe, "foo", json!({"value": 2}))?;
    assert!(!eid.is_valid());

    // jondoe cannot even see it
    assert_eq!(get(&enclave, &jondoe, "foo")?, None);

    // anyone else can update it
    let eid = put(&enclave, &alice, "foo", json!({"value": 2, "policy": "deny-jondoe"}))?;
    assert!(eid.is_valid());
    Ok(())
}

#[test]
fn collection_policy_under_reserved_key() -> CResult<()> {
    let enclave = Enclave::with_buffer_size(
        "test_enclave",
        Arc::new(MemoryStore::new()),
        Arc::new(DenyJondoe),
        1 << 24,
    )?;
    let alice = client("alice");
    let jondoe = client("jondoe");

    // The collection policy is a program stored under the key `policy`.
    put(&enclave, &alice, "policy", json!("deny-jondoe"))?;

    assert!(!put(&enclave, &jondoe, "anything", json!(1))?.is_valid());
    assert!(put(&enclave, &alice, "something", json!(1))?.is_valid());
    Ok(())
}

#[test]
fn clear_twice_is_a_fixpoint() -> CResult<()> {
    let enclave = test_enclave()?;
    let ctx = client("tester");

    for i in 0..25 {
        put(&enclave, &ctx, &format!("k{}", i), json!({"i": i}))?;
    }

    for _ in 0..2 {
        let (response, _) =
            handle(&enclave, &ctx, Request::Clear { collection: COLLECTION.into() })?;
        assert_eq!(response, Response::Bool(true));

        let (response, _) = handle(
            &enclave,
            &ctx,
            Request::CountObjects { collection: COLLECTION.into(), predicates: json!({}) },
        )?;
        assert_eq!(response, Response::Count(0));
    }
    Ok(())
}

#[test]
fn survives_reload_from_encrypted_file_store() -> CResult<()> {
    // The store only ever sees ciphertext, and a fresh buffer manager can
    // read everything back.
    let dir = tempdir::TempDir::new("credb")?;
    let key = [3u8; 64];

    let store =
        Arc::new(EncryptedStore::new(FileStore::new(dir.path().join("db"))?, key));
    let enclave =
        Enclave::with_buffer_size("test_enclave", store, Arc::new(AllowAll), 1 << 24)?;
    let ctx = client("tester");

    put(&enclave, &ctx, "foo", json!({"secret": "value"}))?;
    let (_, value) = get(&enclave, &ctx, "foo")?.unwrap();
    assert_eq!(value, json!({"secret": "value"}));

    // No plaintext leaks into the files the untrusted host sees.
    for entry in std::fs::read_dir(dir.path().join("db"))? {
        let bytes = std::fs::read(entry?.path())?;
        let haystack = String::from_utf8_lossy(&bytes);
        assert!(!haystack.contains("secret"));
    }
    Ok(())
}

#[test]
fn put_without_key_and_history() -> CResult<()> {
    let enclave = test_enclave()?;
    let ctx = client("tester");

    let (response, _) = handle(
        &enclave,
        &ctx,
        Request::PutObjectWithoutKey { collection: COLLECTION.into(), document: json!({"x": 1}) },
    )?;
    let key = match response {
        Response::GeneratedKey { event, key } => {
            assert!(event.is_valid());
            key
        }
        other => panic!("unexpected response: {:?}", other),
    };

    handle(
        &enclave,
        &ctx,
        Request::PutObject {
            collection: COLLECTION.into(),
            key: key.clone(),
            document: json!({"x": 2}),
        },
    )?;

    let (response, _) = handle(
        &enclave,
        &ctx,
        Request::GetObjectHistory { collection: COLLECTION.into(), key },
    )?;
    assert_eq!(response, Response::History(vec![json!({"x": 2}), json!({"x": 1})]));
    Ok(())
}
