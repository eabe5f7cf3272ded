//! `credb` is a trusted key-value store that runs inside a
//! hardware-isolated enclave and persists its state, encrypted, on an
//! untrusted host. Objects live in an append-only per-shard ledger of
//! events; every mutation appends a new version, so the full history of
//! any object stays available and provable. Clients can ask for signed
//! witnesses over any operation and verify them offline against the
//! enclave's public key.
//!
//! The crate covers the trusted data plane: the ledger and its blocks,
//! the buffer manager caching encrypted pages, the primary and secondary
//! indexes, object iterators, and the MVCC/transaction engine with three
//! isolation levels and two-phase commit across peers. Attestation,
//! message framing, socket handling and the policy interpreter live
//! outside and are consumed through the traits in [`page`], [`policy`]
//! and [`peer`].
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use credb::enclave::Enclave;
//! use credb::error::CResult;
//! use credb::page::MemoryStore;
//! use credb::policy::{AllowAll, Identity, OpContext};
//! use credb::protocol::{handle, Request, Response};
//! use serde_json::json;
//!
//! fn main() -> CResult<()> {
//!     let enclave = Enclave::new("demo", Arc::new(MemoryStore::new()), Arc::new(AllowAll))?;
//!     let ctx = OpContext::new(Identity::client("alice"));
//!
//!     let (response, _) = handle(&enclave, &ctx, Request::PutObject {
//!         collection: "test".into(),
//!         key: "foo".into(),
//!         document: json!({"a": 42}),
//!     })?;
//!     assert!(matches!(response, Response::Event(_)));
//!
//!     let (response, witness) = handle(&enclave, &ctx, Request::GetObject {
//!         collection: "test".into(),
//!         key: "foo".into(),
//!         generate_witness: true,
//!     })?;
//!     assert!(matches!(response, Response::Value { .. }));
//!
//!     // Anyone holding the enclave's public key can verify the witness.
//!     assert!(witness.unwrap().is_valid(&enclave.public_key_base64())?);
//!     Ok(())
//! }
//! ```

pub mod doc;
pub mod enclave;
pub mod error;
pub mod index;
pub mod ledger;
pub mod page;
pub mod peer;
pub mod policy;
pub mod protocol;
pub mod sync;
pub mod task;
pub mod tx;
pub mod types;
pub mod witness;

pub use enclave::Enclave;
pub use error::{CResult, Error};
pub use types::{EventId, OrderResult, INVALID_EVENT};
pub use witness::Witness;
