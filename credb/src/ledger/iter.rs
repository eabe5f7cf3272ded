//! Iterators over objects: the history walk along a version chain and the
//! filtered scan over a collection.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::doc;
use crate::error::CResult;
use crate::index::hash_map::NUM_BUCKETS;
use crate::policy::{OpContext, OperationType};
use crate::sync::LockType;
use crate::types::{BlockId, EventId, ShardId, INVALID_BLOCK};

use super::block::{Event, EventKind};
use super::collection::Collection;
use super::lock_handle::LockHandle;
use super::Ledger;

/// Walks one object's version chain, newest first.
///
/// Deletion events end the walk (the history of a re-created object starts
/// at its newest creation), and versions the object policy hides from the
/// caller end it as well.
pub struct ObjectIterator<'a> {
    ledger: &'a Ledger,
    op_context: &'a OpContext,
    collection: String,
    key: String,
    path: String,
    lock_handle: LockHandle<'a>,
    shard_no: ShardId,
    current: Option<(EventId, Event)>,
    started: bool,
    held_block: BlockId,
}

impl<'a> ObjectIterator<'a> {
    pub(crate) fn new(
        ledger: &'a Ledger,
        op_context: &'a OpContext,
        collection: &str,
        key: &str,
        path: &str,
        parent: Option<&'a LockHandle<'a>>,
    ) -> Self {
        let lock_handle = match parent {
            Some(parent) => LockHandle::with_parent(ledger.arc(), parent),
            None => ledger.handle(),
        };

        Self {
            ledger,
            op_context,
            collection: collection.to_string(),
            key: key.to_string(),
            path: path.to_string(),
            lock_handle,
            shard_no: ledger.shard_of(collection, key),
            current: None,
            started: false,
            held_block: INVALID_BLOCK,
        }
    }

    fn check_event(&self, event: &Event) -> CResult<bool> {
        if event.kind == EventKind::Deletion {
            return Ok(false);
        }

        if let Some(policy) = event.policy()? {
            let object = event.value()?;
            let allowed = self.ledger.check_object_policy(
                &policy,
                self.op_context,
                &self.collection,
                &self.key,
                &self.path,
                OperationType::GetObject,
                Some(&object),
            );
            return Ok(allowed);
        }

        Ok(true)
    }

    fn release_held(&mut self) {
        if self.held_block != INVALID_BLOCK {
            self.lock_handle.release_block(self.shard_no, self.held_block, LockType::Read);
            self.held_block = INVALID_BLOCK;
        }
    }

    /// Advance to the next version, returning its id and raw event.
    pub fn next_handle(&mut self) -> CResult<Option<(EventId, Event)>> {
        if !self.started {
            self.started = true;

            let found = self.ledger.get_latest_version(
                self.op_context,
                &self.collection,
                &self.key,
                &self.path,
                &self.lock_handle,
                LockType::Read,
                OperationType::GetObjectHistory,
            )?;

            match found {
                Some((eid, event)) => {
                    self.held_block = eid.block;
                    self.current = Some((eid, event.clone()));
                    return Ok(Some((eid, event)));
                }
                None => return Ok(None),
            }
        }

        let current_event = match &self.current {
            Some((_, event)) => event.clone(),
            None => return Ok(None),
        };

        let (block, index) = match current_event.previous {
            Some(previous) => previous,
            None => {
                self.release_held();
                self.current = None;
                return Ok(None);
            }
        };

        let eid = EventId::new(self.shard_no, block, index);
        let hdl = self.lock_handle.get_block(self.shard_no, block, LockType::Read)?;
        let event = hdl.get_event(index)?;
        drop(hdl);

        // Keep the newly visited block's acquisition, let the old one go.
        let previous_held = self.held_block;
        self.held_block = block;
        if previous_held != INVALID_BLOCK && previous_held != block {
            self.lock_handle.release_block(self.shard_no, previous_held, LockType::Read);
        } else if previous_held == block {
            // Same block: drop the extra acquisition we just took.
            self.lock_handle.release_block(self.shard_no, block, LockType::Read);
        }

        if !self.check_event(&event)? {
            self.release_held();
            self.current = None;
            return Ok(None);
        }

        self.current = Some((eid, event.clone()));
        Ok(Some((eid, event)))
    }

    /// Advance and project the version's value at the iterator's path.
    ///
    /// Versions without the path yield an invalid event id and are
    /// otherwise skipped, rather than ending the walk.
    pub fn next(&mut self) -> CResult<Option<(EventId, Value)>> {
        let (eid, event) = match self.next_handle()? {
            Some(found) => found,
            None => return Ok(None),
        };

        let value = event.value()?;
        if self.path.is_empty() {
            return Ok(Some((eid, value)));
        }

        match doc::get_path(&value, &self.path) {
            Some(sub) => Ok(Some((eid, sub.clone()))),
            None => Ok(Some((crate::types::INVALID_EVENT, Value::Null))),
        }
    }
}

impl<'a> Drop for ObjectIterator<'a> {
    fn drop(&mut self) {
        self.release_held();
    }
}

/// Where a collection scan draws its candidate keys from.
enum KeyProvider {
    /// Planner-provided candidates from the secondary indexes.
    Vector(std::vec::IntoIter<String>),

    /// Linear scan over the primary index, one bucket at a time.
    Scan { col: Arc<Collection>, bucket: usize, pending: VecDeque<String> },

    /// The collection does not exist.
    Empty,
}

impl KeyProvider {
    fn next_key(&mut self) -> CResult<Option<String>> {
        match self {
            KeyProvider::Vector(keys) => Ok(keys.next()),
            KeyProvider::Scan { col, bucket, pending } => {
                while pending.is_empty() && *bucket < NUM_BUCKETS {
                    let entries = col.primary_index().bucket_entries(*bucket)?;
                    *bucket += 1;
                    pending.extend(entries.into_iter().map(|(key, _)| key));
                }
                Ok(pending.pop_front())
            }
            KeyProvider::Empty => Ok(None),
        }
    }
}

/// Scans a collection for objects whose latest version matches the
/// predicates and passes the object policy.
///
/// The iterator keeps the current object's shard under read lock between
/// calls and releases it before moving to a key on a different shard.
pub struct ObjectListIterator<'a> {
    ledger: &'a Ledger,
    op_context: &'a OpContext,
    collection: String,
    predicates: Value,
    limit: Option<usize>,
    yielded: usize,
    lock_handle: LockHandle<'a>,
    keys: KeyProvider,
    current_shard: Option<ShardId>,
    current_block: BlockId,
}

impl<'a> ObjectListIterator<'a> {
    fn build(
        ledger: &'a Ledger,
        op_context: &'a OpContext,
        collection: &str,
        predicates: Value,
        limit: Option<usize>,
        keys: KeyProvider,
        parent: Option<&'a LockHandle<'a>>,
    ) -> Self {
        let lock_handle = match parent {
            Some(parent) => LockHandle::with_parent(ledger.arc(), parent),
            None => ledger.handle(),
        };

        Self {
            ledger,
            op_context,
            collection: collection.to_string(),
            predicates,
            limit,
            yielded: 0,
            lock_handle,
            keys,
            current_shard: None,
            current_block: INVALID_BLOCK,
        }
    }

    pub(crate) fn empty(
        ledger: &'a Ledger,
        op_context: &'a OpContext,
        collection: &str,
        predicates: Value,
        parent: Option<&'a LockHandle<'a>>,
    ) -> Self {
        Self::build(ledger, op_context, collection, predicates, None, KeyProvider::Empty, parent)
    }

    pub(crate) fn with_keys(
        ledger: &'a Ledger,
        op_context: &'a OpContext,
        collection: &str,
        predicates: Value,
        limit: Option<usize>,
        keys: Vec<String>,
        parent: Option<&'a LockHandle<'a>>,
    ) -> Self {
        Self::build(
            ledger,
            op_context,
            collection,
            predicates,
            limit,
            KeyProvider::Vector(keys.into_iter()),
            parent,
        )
    }

    pub(crate) fn linear_scan(
        ledger: &'a Ledger,
        op_context: &'a OpContext,
        collection: &str,
        predicates: Value,
        limit: Option<usize>,
        col: Arc<Collection>,
        parent: Option<&'a LockHandle<'a>>,
    ) -> Self {
        Self::build(
            ledger,
            op_context,
            collection,
            predicates,
            limit,
            KeyProvider::Scan { col, bucket: 0, pending: VecDeque::new() },
            parent,
        )
    }

    fn release_current(&mut self) {
        if let Some(shard) = self.current_shard.take() {
            if self.current_block != INVALID_BLOCK {
                self.lock_handle.release_block(shard, self.current_block, LockType::Read);
            }
        }
        self.current_block = INVALID_BLOCK;
    }

    /// The next matching object, or `None` when the scan is exhausted.
    pub fn next_entry(&mut self) -> CResult<Option<(String, EventId, Value)>> {
        if let Some(limit) = self.limit {
            if self.yielded >= limit {
                self.release_current();
                return Ok(None);
            }
        }

        let mut filtered = 0usize;

        while let Some(key) = self.keys.next_key()? {
            // Release the previous object's shard before touching a new one.
            self.release_current();

            let found = self.ledger.get_latest_version(
                self.op_context,
                &self.collection,
                &key,
                "",
                &self.lock_handle,
                LockType::Read,
                OperationType::FindObjects,
            )?;

            let (eid, event) = match found {
                Some(found) => found,
                None => continue,
            };

            self.current_shard = Some(eid.shard);
            self.current_block = eid.block;

            let value = event.value()?;
            if doc::matches_predicates(&value, &self.predicates) {
                self.yielded += 1;
                return Ok(Some((key, eid, value)));
            }
            filtered += 1;
        }

        if filtered > 100 {
            log::debug!("{} keys filtered out by the predicate", filtered);
        }

        self.release_current();
        Ok(None)
    }
}

impl<'a> Drop for ObjectListIterator<'a> {
    fn drop(&mut self) {
        self.release_current();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_context, test_ledger};
    use super::*;
    use serde_json::json;

    const COLLECTION: &str = "test";

    #[test]
    fn history_walk_newest_first() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        for n in 1..=3 {
            ledger.put(&ctx, COLLECTION, "foo", &json!({"n": n}), "", None)?;
        }

        let mut iter = ledger.iterate(&ctx, COLLECTION, "foo", "", None);
        let mut versions = Vec::new();
        while let Some((_, value)) = iter.next()? {
            versions.push(value);
        }

        assert_eq!(versions, vec![json!({"n": 3}), json!({"n": 2}), json!({"n": 1})]);
        Ok(())
    }

    #[test]
    fn history_ends_at_deletion() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "foo", &json!({"v": 1}), "", None)?;
        ledger.remove(&ctx, COLLECTION, "foo", None)?;
        ledger.put(&ctx, COLLECTION, "foo", &json!({"v": 2}), "", None)?;

        let mut iter = ledger.iterate(&ctx, COLLECTION, "foo", "", None);
        let mut versions = Vec::new();
        while let Some((_, value)) = iter.next()? {
            versions.push(value);
        }

        // Only the post-recreation history is visible.
        assert_eq!(versions, vec![json!({"v": 2})]);
        Ok(())
    }

    #[test]
    fn path_projection_skips_versions_without_the_path() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "foo", &json!({"other": 1}), "", None)?;
        ledger.put(&ctx, COLLECTION, "foo", &json!({"a": {"b": 7}}), "", None)?;

        let mut iter = ledger.iterate(&ctx, COLLECTION, "foo", "a.b", None);

        let (eid, value) = iter.next()?.unwrap();
        assert!(eid.is_valid());
        assert_eq!(value, json!(7));

        // The older version lacks the path: invalid id, not a crash.
        let (eid, _) = iter.next()?.unwrap();
        assert!(!eid.is_valid());

        assert!(iter.next()?.is_none());
        Ok(())
    }

    #[test]
    fn list_iterator_filters_by_predicate() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "k1", &json!({"a": 42, "b": 23}), "", None)?;
        ledger.put(&ctx, COLLECTION, "k2", &json!({"a": 43, "b": 23}), "", None)?;
        ledger.put(&ctx, COLLECTION, "k3", &json!({"a": 44, "b": 9}), "", None)?;

        let mut iter = ledger.find(&ctx, COLLECTION, json!({"b": 23}), None, None)?;
        let mut keys = Vec::new();
        while let Some((key, _, _)) = iter.next_entry()? {
            keys.push(key);
        }
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
        Ok(())
    }

    #[test]
    fn list_iterator_skips_deleted() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        ledger.put(&ctx, COLLECTION, "k1", &json!({"x": 1}), "", None)?;
        ledger.put(&ctx, COLLECTION, "k2", &json!({"x": 2}), "", None)?;
        ledger.remove(&ctx, COLLECTION, "k1", None)?;

        assert_eq!(ledger.count_objects(&ctx, COLLECTION, json!({}))?, 1);
        Ok(())
    }

    #[test]
    fn limit_stops_the_scan() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        for i in 0..10 {
            ledger.put(&ctx, COLLECTION, &format!("k{}", i), &json!({"x": i}), "", None)?;
        }

        let mut iter = ledger.find(&ctx, COLLECTION, json!({}), Some(3), None)?;
        let mut count = 0;
        while iter.next_entry()?.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        Ok(())
    }

    #[test]
    fn find_scans_missing_collections_as_empty() -> CResult<()> {
        let ledger = test_ledger()?;
        let ctx = test_context();

        let mut iter = ledger.find(&ctx, "nope", json!({}), None, None)?;
        assert!(iter.next_entry()?.is_none());
        Ok(())
    }
}
