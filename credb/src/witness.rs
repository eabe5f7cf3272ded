//! Witnesses: signed commitments to what the store observed.
//!
//! A witness carries a JSON digest (isolation level plus an array of
//! per-operation records) and a detached signature produced with the
//! enclave's private key. Anyone holding the enclave's advertised public
//! key can verify a witness offline, including from its armored text form.

use base64::engine::general_purpose;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CResult, Error};

pub const BEGIN_MESSAGE: &str = "-----BEGIN CREDB WITNESS MESSAGE-----";
pub const END_MESSAGE: &str = "-----END CREDB WITNESS MESSAGE-----";

/// Name of the JSON field that holds the operation records.
pub const OP_FIELD_NAME: &str = "operations";
pub const ISOLATION_FIELD_NAME: &str = "isolation";
pub const SHARD_FIELD_NAME: &str = "shard";
pub const BLOCK_FIELD_NAME: &str = "block";
pub const INDEX_FIELD_NAME: &str = "index";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    /// The JSON digest as raw bytes; hashing operates on exactly these.
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,

    /// Detached signature over the SHA-256 hash of `data`.
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

impl Witness {
    pub fn from_digest(digest: &Value) -> CResult<Self> {
        Ok(Self { data: serde_json::to_vec(digest)?, signature: Vec::new() })
    }

    /// The digest in JSON form.
    pub fn digest(&self) -> CResult<Value> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Sign the digest with the enclave's private key. Called once, at the
    /// end of commit.
    pub fn sign(&mut self, key: &SigningKey) -> CResult<()> {
        let hash = Sha256::digest(&self.data);
        self.signature = key.sign(hash.as_slice()).to_bytes().to_vec();
        Ok(())
    }

    /// Verify by recomputing the hash over the JSON body and checking the
    /// signature against the advertised public key.
    pub fn valid(&self, public_key: &VerifyingKey) -> bool {
        let signature = match Signature::from_slice(&self.signature) {
            Ok(signature) => signature,
            Err(_) => return false,
        };

        let hash = Sha256::digest(&self.data);
        public_key.verify(hash.as_slice(), &signature).is_ok()
    }

    /// Verify against a base64-encoded public key, as servers advertise it.
    pub fn is_valid(&self, public_key_base64: &str) -> CResult<bool> {
        let decoded = general_purpose::STANDARD
            .decode(public_key_base64)
            .map_err(|err| Error::InvalidArgument(format!("bad public key: {}", err)))?;
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("invalid public key length".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| Error::InvalidArgument(format!("bad public key: {}", err)))?;
        Ok(self.valid(&key))
    }

    /// Base64-armored text form.
    pub fn armor(&self) -> CResult<String> {
        let body = general_purpose::STANDARD.encode(bincode::serialize(self)?);
        Ok(format!("{}\n{}\n{}", BEGIN_MESSAGE, body, END_MESSAGE))
    }

    /// Parse the armored form back into a witness.
    pub fn from_armor(text: &str) -> CResult<Self> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix(BEGIN_MESSAGE)
            .and_then(|rest| rest.strip_suffix(END_MESSAGE))
            .ok_or_else(|| Error::InvalidArgument("not an armored witness".into()))?;

        let bytes = general_purpose::STANDARD
            .decode(body.trim().replace('\n', ""))
            .map_err(|err| Error::InvalidArgument(format!("bad witness armor: {}", err)))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Collects per-operation records into a witness digest while a
/// transaction or operation runs.
pub struct WitnessBuilder {
    isolation: String,
    operations: Vec<Value>,
}

impl WitnessBuilder {
    pub fn new(isolation: &str) -> Self {
        Self { isolation: isolation.to_string(), operations: Vec::new() }
    }

    /// Operation records appear in the order they were appended.
    pub fn append(&mut self, record: Value) {
        self.operations.push(record);
    }

    pub fn build(self) -> Value {
        serde_json::json!({
            ISOLATION_FIELD_NAME: self.isolation,
            OP_FIELD_NAME: self.operations,
        })
    }
}
