//! Who is calling, and may they? Identities, operation contexts and the
//! seam to the external policy evaluator.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CResult;

/// Unique identifier derived from an identity. Used to address peers and
/// to name transaction roots.
pub type IdentityUid = u64;

pub const INVALID_UID: IdentityUid = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    Client,
    Server,
}

/// A client or server identity, as established by attestation before any
/// data operation reaches the core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub kind: IdentityKind,
    pub name: String,
}

impl Identity {
    pub fn client(name: &str) -> Self {
        Self { kind: IdentityKind::Client, name: name.to_string() }
    }

    pub fn server(name: &str) -> Self {
        Self { kind: IdentityKind::Server, name: name.to_string() }
    }

    pub fn uid(&self) -> IdentityUid {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        // uid 0 is reserved for "invalid"
        hasher.finish().max(1)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            IdentityKind::Client => write!(f, "client://{}", self.name),
            IdentityKind::Server => write!(f, "server://{}", self.name),
        }
    }
}

/// Operations as seen by policies and witnesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    GetObject,
    HasObject,
    CheckObject,
    PutObject,
    AddToObject,
    RemoveObject,
    GetObjectHistory,
    FindObjects,
    CountObjects,
    DiffVersions,
    Clear,
    CallProgram,
}

/// Holds information about who or what is invoking an operation.
///
/// The invalid context marks internal calls, most importantly policy
/// evaluation itself: policies never see (or gate) other policy runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpContext {
    identity: Option<Identity>,
    program: String,
}

impl OpContext {
    pub fn new(identity: Identity) -> Self {
        Self { identity: Some(identity), program: String::new() }
    }

    pub fn for_program(identity: Identity, program: &str) -> Self {
        Self { identity: Some(identity), program: program.to_string() }
    }

    /// The sentinel context that bypasses policy checks.
    pub fn invalid() -> Self {
        Self { identity: None, program: String::new() }
    }

    pub fn is_valid(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn called_by_program(&self) -> bool {
        !self.program.is_empty()
    }

    pub fn program_name(&self) -> &str {
        &self.program
    }

    /// The identity string recorded as an event's source.
    pub fn source(&self) -> String {
        match &self.identity {
            Some(identity) if self.called_by_program() => {
                format!("{}:{}", identity, self.program)
            }
            Some(identity) => identity.to_string(),
            None => String::new(),
        }
    }
}

/// Everything a policy program gets bound to when it runs.
pub struct PolicyBindings<'a> {
    pub op_context: &'a OpContext,
    pub collection: &'a str,
    pub key: &'a str,
    pub path: &'a str,
    pub op_type: OperationType,

    /// Snapshot of the guarded object, for object policies.
    pub object: Option<&'a Value>,
}

/// External evaluator for policy programs.
///
/// Programs are opaque to the core; the only contract is this binding set.
/// Evaluation runs under the caller's lock handle, with the invalid op
/// context, so policies cannot recurse into policy checks.
pub trait PolicyEvaluator: Send + Sync {
    fn evaluate(&self, program: &Value, bindings: &PolicyBindings<'_>) -> CResult<bool>;
}

/// Default evaluator for deployments without a policy interpreter.
pub struct AllowAll;

impl PolicyEvaluator for AllowAll {
    fn evaluate(&self, _program: &Value, _bindings: &PolicyBindings<'_>) -> CResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_strings() {
        let ctx = OpContext::new(Identity::client("tester"));
        assert_eq!(ctx.source(), "client://tester");

        let ctx = OpContext::for_program(Identity::server("nodeA"), "audit");
        assert_eq!(ctx.source(), "server://nodeA:audit");
        assert!(ctx.called_by_program());
    }

    #[test]
    fn invalid_context() {
        let ctx = OpContext::invalid();
        assert!(!ctx.is_valid());
        assert_eq!(ctx.source(), "");
    }

    #[test]
    fn uids_are_stable_and_nonzero() {
        let a = Identity::client("a");
        assert_eq!(a.uid(), Identity::client("a").uid());
        assert_ne!(a.uid(), INVALID_UID);
        assert_ne!(a.uid(), Identity::server("a").uid());
    }
}
