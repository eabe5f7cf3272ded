//! Secondary indexes: hash indexes over JSON document projections.

pub mod hash_map;
pub mod multi_map;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::doc;
use crate::error::CResult;
use crate::page::BufferManager;

pub use hash_map::{Cursor, IndexChange, PrimaryIndex};
pub use multi_map::{hash_projection, MultiMap, SetOperation};

/// A named index over one or more JSON paths of a collection's documents.
///
/// Backed by a hash multi map, so only equality and `$in` predicates can
/// be answered; anything else forces the planner onto a linear scan.
pub struct SecondaryIndex {
    name: String,
    paths: Vec<String>,
    map: MultiMap,
}

impl SecondaryIndex {
    pub fn new(buffer: Arc<BufferManager>, name: &str, paths: Vec<String>) -> Self {
        let map = MultiMap::new(buffer, name);
        Self { name: name.to_string(), paths, map }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Can this index answer the predicate? Every indexed path must be
    /// constrained, and only by equality or `$in`.
    pub fn matches_query(&self, predicates: &Value) -> bool {
        let map = match predicates {
            Value::Object(map) => map,
            _ => return false,
        };

        self.paths.iter().all(|path| match map.get(path) {
            None => false,
            Some(Value::Object(cond)) => {
                let ops: Vec<_> = cond.keys().filter(|k| k.starts_with('$')).collect();
                if ops.is_empty() {
                    // a literal object must match exactly
                    true
                } else {
                    ops.iter().all(|op| matches!(op.as_str(), "$eq" | "$in"))
                }
            }
            Some(_) => true,
        })
    }

    /// Index a document under `key`. Documents missing any indexed path are
    /// not indexed. Returns whether an entry was added.
    pub fn insert(&self, document: &Value, key: &str) -> CResult<bool> {
        match self.projection(document) {
            Some(projection) => {
                self.map.insert(hash_projection(&projection), key)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the entry a document created under `key`.
    pub fn remove(&self, document: &Value, key: &str) -> CResult<bool> {
        match self.projection(document) {
            Some(projection) => self.map.remove(hash_projection(&projection), key),
            None => Ok(false),
        }
    }

    /// Answer a predicate: union the matching key sets into `out`, or
    /// intersect them with what is already there.
    pub fn find(&self, predicates: &Value, out: &mut HashSet<String>, op: SetOperation) -> CResult<()> {
        let mut matches = HashSet::new();
        for candidate in self.candidates(predicates) {
            self.map.find(hash_projection(&candidate), &mut matches, SetOperation::Union)?;
        }

        match op {
            SetOperation::Union => out.extend(matches),
            SetOperation::Intersect => out.retain(|v| matches.contains(v)),
        }
        Ok(())
    }

    /// Estimate how many keys the predicate selects through this index.
    pub fn estimate_value_count(&self, predicates: &Value) -> CResult<usize> {
        let mut total = 0;
        for candidate in self.candidates(predicates) {
            total += self.map.estimate_value_count(hash_projection(&candidate))?;
        }
        Ok(total)
    }

    pub fn clear(&self) -> CResult<()> {
        self.map.clear()
    }

    /// Do two documents agree on every indexed path?
    pub fn compare(&self, first: &Value, second: &Value) -> bool {
        doc::project(first, &self.paths) == doc::project(second, &self.paths)
    }

    /// The exact projection a document is stored under, if it has all the
    /// indexed paths.
    fn projection(&self, document: &Value) -> Option<Value> {
        let mut out = Value::Object(Map::new());
        for path in &self.paths {
            let value = doc::get_path(document, path)?;
            doc::insert_path(&mut out, path, value.clone()).ok()?;
        }
        Some(out)
    }

    /// Expand a predicate into the point projections to look up: `$in`
    /// turns into one candidate per listed value.
    fn candidates(&self, predicates: &Value) -> Vec<Value> {
        let mut candidates = vec![Value::Object(Map::new())];

        for path in &self.paths {
            // Predicate documents key conditions by the full path string.
            let condition = match predicates.as_object().and_then(|map| map.get(path.as_str())) {
                Some(condition) => condition,
                None => return Vec::new(),
            };

            let options: Vec<Value> = match condition {
                Value::Object(map) if map.contains_key("$in") => match map.get("$in") {
                    Some(Value::Array(values)) => values.clone(),
                    _ => return Vec::new(),
                },
                Value::Object(map) if map.contains_key("$eq") => {
                    match map.get("$eq") {
                        Some(value) => vec![value.clone()],
                        None => return Vec::new(),
                    }
                }
                literal => vec![literal.clone()],
            };

            let mut expanded = Vec::with_capacity(candidates.len() * options.len());
            for candidate in &candidates {
                for option in &options {
                    let mut next = candidate.clone();
                    if doc::insert_path(&mut next, path, option.clone()).is_ok() {
                        expanded.push(next);
                    }
                }
            }
            candidates = expanded;
        }

        candidates
    }
}
