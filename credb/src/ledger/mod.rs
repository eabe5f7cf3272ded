//! The trusted data plane's core: a sharded, append-only ledger of object
//! events, with a primary index per collection and hash indexes over
//! document projections.
//!
//! All object operations funnel through here. Each operation tracks its
//! shard locks in a [`LockHandle`]; transactions pass their own handle in
//! as a parent so the whole transaction owns every lock its operations
//! take.

pub mod block;
pub mod collection;
pub mod iter;
pub mod lock_handle;
pub mod shard;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::doc;
use crate::error::{CResult, Error};
use crate::index::IndexChange;
use crate::page::BufferManager;
use crate::peer::{IndexUpdate, Peers};
use crate::policy::{OpContext, OperationType, PolicyBindings, PolicyEvaluator};
use crate::sync::LockType;
use crate::types::{
    EventId, LedgerPos, ShardId, VersionNo, INITIAL_VERSION_NO, INVALID_EVENT, INVALID_PAGE_NO,
    MIN_BLOCK_SIZE, NUM_SHARDS,
};

pub use block::{Block, Event, EventKind};
pub use collection::Collection;
pub use iter::{ObjectIterator, ObjectListIterator};
pub use lock_handle::LockHandle;
pub use shard::Shard;

/// Generated keys for `put_without_key` are this long.
const GENERATED_KEY_LEN: usize = 10;

/// How many keys `clear` tombstones per lock acquisition.
const CLEAR_BATCH_SIZE: usize = 100;

/// The reserved key a collection's policy program lives under.
const POLICY_KEY: &str = "policy";

pub struct Ledger {
    weak_self: Weak<Ledger>,
    buffer: Arc<BufferManager>,
    shards: Vec<Shard>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    policy: Arc<dyn PolicyEvaluator>,
    peers: Arc<Peers>,
    object_count: AtomicUsize,
    version_count: AtomicUsize,
}

impl Ledger {
    pub fn new(
        buffer: Arc<BufferManager>,
        policy: Arc<dyn PolicyEvaluator>,
        peers: Arc<Peers>,
    ) -> CResult<Arc<Self>> {
        let shards = (0..NUM_SHARDS)
            .map(|id| Shard::new(id, buffer.clone()))
            .collect::<CResult<Vec<_>>>()?;

        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            buffer,
            shards,
            collections: RwLock::new(HashMap::new()),
            policy,
            peers,
            object_count: AtomicUsize::new(0),
            version_count: AtomicUsize::new(0),
        }))
    }

    /// The owning `Arc`; lock handles keep the ledger alive through it.
    pub(crate) fn arc(&self) -> Arc<Ledger> {
        self.weak_self.upgrade().expect("ledger already dropped")
    }

    /// A fresh top-level lock handle for one operation.
    pub fn handle(&self) -> LockHandle<'static> {
        LockHandle::new(self.arc())
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn shard(&self, shard_no: ShardId) -> &Shard {
        &self.shards[shard_no as usize]
    }

    /// Which shard a key lives on.
    pub fn shard_of(&self, collection: &str, key: &str) -> ShardId {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        collection.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() % NUM_SHARDS as u64) as ShardId
    }

    /// Total number of live objects across all collections.
    pub fn num_objects(&self) -> usize {
        self.object_count.load(Ordering::SeqCst)
    }

    pub fn num_collections(&self) -> usize {
        self.collections.read().unwrap().len()
    }

    /// Keys must be non-empty and free of path separators.
    pub fn is_valid_key(key: &str) -> bool {
        !key.is_empty() && !key.contains('.')
    }

    pub fn try_get_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().unwrap().get(name).cloned()
    }

    pub fn get_collection(&self, name: &str) -> Arc<Collection> {
        if let Some(col) = self.try_get_collection(name) {
            return col;
        }

        let mut collections = self.collections.write().unwrap();
        collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collection::new(self.buffer.clone(), name)))
            .clone()
    }

    // ------------------------------------------------------------------
    // Event lookup
    // ------------------------------------------------------------------

    /// Load the event at `eid`. The shard acquisition is released before
    /// returning.
    pub(crate) fn get_event(&self, eid: &EventId, lock_handle: &LockHandle, lock_type: LockType) -> CResult<Event> {
        let block = lock_handle.get_block(eid.shard, eid.block, lock_type)?;
        let event = block.get_event(eid.index);
        drop(block);
        lock_handle.release_block(eid.shard, eid.block, lock_type);
        event
    }

    /// The immediate predecessor event, if any.
    pub(crate) fn get_previous_event(
        &self,
        shard_no: ShardId,
        current: &Event,
        lock_handle: &LockHandle,
        lock_type: LockType,
    ) -> CResult<Option<Event>> {
        match current.previous {
            None => Ok(None),
            Some((block, index)) => {
                let eid = EventId::new(shard_no, block, index);
                Ok(Some(self.get_event(&eid, lock_handle, lock_type)?))
            }
        }
    }

    /// Walk predecessors until a NewVersion is found. A Deletion or the
    /// chain's end yields `None`.
    pub(crate) fn get_previous_version(
        &self,
        shard_no: ShardId,
        current: &Event,
        lock_handle: &LockHandle,
        lock_type: LockType,
    ) -> CResult<Option<Event>> {
        let mut event = current.clone();

        while event.kind != EventKind::NewVersion {
            if event.kind == EventKind::Deletion {
                return Ok(None);
            }

            match event.previous {
                None => return Ok(None),
                Some((block, index)) => {
                    let eid = EventId::new(shard_no, block, index);
                    event = self.get_event(&eid, lock_handle, lock_type)?;
                }
            }
        }

        Ok(Some(event))
    }

    /// The newest event recorded for a key, straight out of the primary
    /// index. On `Some`, one shard acquisition is left held for the caller.
    pub(crate) fn get_latest_event(
        &self,
        collection: &str,
        key: &str,
        lock_handle: &LockHandle,
        lock_type: LockType,
    ) -> CResult<Option<(EventId, Event)>> {
        if key.is_empty() {
            return Ok(None);
        }

        let col = match self.try_get_collection(collection) {
            Some(col) => col,
            None => return Ok(None),
        };

        let eid = match col.primary_index().get(key)? {
            Some(eid) => eid,
            None => return Ok(None),
        };

        let block = lock_handle.get_block(eid.shard, eid.block, lock_type)?;
        let event = block.get_event(eid.index)?;
        Ok(Some((eid, event)))
    }

    /// The current live version of a key, after policy evaluation.
    ///
    /// Returns `None` for missing or deleted objects and for objects the
    /// policy hides from this context. On `Some`, one shard acquisition is
    /// left held; the caller releases it via
    /// `release_block(eid.shard, eid.block, ..)`.
    pub(crate) fn get_latest_version(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        path: &str,
        lock_handle: &LockHandle,
        lock_type: LockType,
        access_type: OperationType,
    ) -> CResult<Option<(EventId, Event)>> {
        let (mut eid, mut event) =
            match self.get_latest_event(collection, key, lock_handle, lock_type)? {
                Some(found) => found,
                None => return Ok(None),
            };

        while event.kind != EventKind::NewVersion {
            if event.kind == EventKind::Deletion {
                lock_handle.release_block(eid.shard, eid.block, lock_type);
                return Ok(None);
            }

            let (block, index) = match event.previous {
                Some(previous) => previous,
                None => {
                    lock_handle.release_block(eid.shard, eid.block, lock_type);
                    return Err(Error::Internal(format!("broken event chain for '{}'", key)));
                }
            };

            let previous_block = eid.block;
            eid = EventId::new(eid.shard, block, index);
            let hdl = lock_handle.get_block(eid.shard, eid.block, lock_type)?;
            event = hdl.get_event(eid.index)?;
            drop(hdl);
            lock_handle.release_block(eid.shard, previous_block, lock_type);
        }

        if let Some(policy) = event.policy()? {
            let object = event.value()?;
            let allowed = self.check_object_policy(
                &policy,
                op_context,
                collection,
                key,
                path,
                access_type,
                Some(&object),
            );
            if !allowed {
                lock_handle.release_block(eid.shard, eid.block, lock_type);
                return Ok(None);
            }
        }

        Ok(Some((eid, event)))
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    /// Evaluate an object's embedded policy. Invalid contexts bypass the
    /// check so policy evaluation cannot recurse.
    pub(crate) fn check_object_policy(
        &self,
        policy: &Value,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        path: &str,
        op_type: OperationType,
        object: Option<&Value>,
    ) -> bool {
        if !op_context.is_valid() {
            return true;
        }

        let bindings =
            PolicyBindings { op_context, collection, key, path, op_type, object };

        match self.policy.evaluate(policy, &bindings) {
            Ok(allowed) => allowed,
            Err(err) => {
                log::error!("object policy failed: {}", err);
                false
            }
        }
    }

    /// Evaluate the collection's policy, stored under the reserved key
    /// `policy`. Call before taking object locks, or pass the handle that
    /// already owns them.
    pub(crate) fn check_collection_policy(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        path: &str,
        op_type: OperationType,
        parent: Option<&LockHandle>,
    ) -> CResult<bool> {
        if !op_context.is_valid() {
            return Ok(true);
        }

        let lock_handle = match parent {
            Some(parent) => LockHandle::with_parent(self.arc(), parent),
            None => self.handle(),
        };
        let empty_context = OpContext::invalid();

        let program = match self.get_latest_version(
            &empty_context,
            collection,
            POLICY_KEY,
            "",
            &lock_handle,
            LockType::Read,
            OperationType::GetObject,
        )? {
            Some((eid, event)) => {
                let value = event.value()?;
                lock_handle.release_block(eid.shard, eid.block, LockType::Read);
                value
            }
            None => return Ok(true),
        };

        let bindings = PolicyBindings {
            op_context,
            collection,
            key,
            path,
            op_type,
            object: None,
        };

        match self.policy.evaluate(&program, &bindings) {
            Ok(allowed) => Ok(allowed),
            Err(err) => {
                log::error!("collection policy failed: {}", err);
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a new object or a new version of an existing one. A
    /// non-empty path updates inside the current value, which must exist.
    ///
    /// Returns `INVALID_EVENT` when a policy rejects the write or the
    /// addressed path target is missing.
    pub fn put(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        to_put: &Value,
        path: &str,
        parent: Option<&LockHandle>,
    ) -> CResult<EventId> {
        self.write_version(op_context, collection, key, to_put, path, parent, WriteMode::Replace, None)
    }

    /// Add to an existing object: numbers accumulate, arrays append.
    pub fn add(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        to_add: &Value,
        path: &str,
        parent: Option<&LockHandle>,
    ) -> CResult<EventId> {
        self.write_version(op_context, collection, key, to_add, path, parent, WriteMode::Merge, None)
    }

    /// Create an object under a fresh random key, returned with the event.
    pub fn put_without_key(
        &self,
        op_context: &OpContext,
        collection: &str,
        to_put: &Value,
        parent: Option<&LockHandle>,
    ) -> CResult<(EventId, String)> {
        loop {
            let key: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(GENERATED_KEY_LEN)
                .map(char::from)
                .collect();

            let shard_no = self.shard_of(collection, key.as_str());
            let lock_handle = match parent {
                Some(parent) => LockHandle::with_parent(self.arc(), parent),
                None => self.handle(),
            };

            // Hold the shard write lock across the existence check and the
            // insert so the fresh key cannot race.
            let pending = lock_handle.get_pending_block(shard_no, LockType::Write)?;
            drop(pending);

            let exists =
                match self.get_latest_event(collection, &key, &lock_handle, LockType::Write)? {
                    Some((eid, _)) => {
                        lock_handle.release_block(eid.shard, eid.block, LockType::Write);
                        true
                    }
                    None => false,
                };

            if !exists {
                let eid = self.put_next_version(
                    op_context,
                    collection,
                    &key,
                    to_put,
                    INITIAL_VERSION_NO,
                    INVALID_EVENT,
                    None,
                    &lock_handle,
                    None,
                )?;

                lock_handle.release_block(shard_no, eid.block, LockType::Write);
                drop(lock_handle);

                if parent.is_none() {
                    self.organize_ledger(shard_no)?;
                }
                return Ok((eid, key));
            }

            lock_handle.release_block(shard_no, self.shard(shard_no).pending_block_id(), LockType::Write);
        }
    }

    /// Mark an object as deleted. Returns `INVALID_EVENT` if there is no
    /// live object under the key.
    pub fn remove(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        parent: Option<&LockHandle>,
    ) -> CResult<EventId> {
        self.remove_with_ref(op_context, collection, key, parent, None)
    }

    pub(crate) fn remove_with_ref(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        parent: Option<&LockHandle>,
        tx_ref: Option<LedgerPos>,
    ) -> CResult<EventId> {
        if !Self::is_valid_key(key) {
            return Err(Error::InvalidArgument(format!("invalid key '{}'", key)));
        }

        if !self.check_collection_policy(op_context, collection, key, "", OperationType::RemoveObject, parent)? {
            log::debug!("rejected remove because of collection policy");
            return Ok(INVALID_EVENT);
        }

        let lock_handle = match parent {
            Some(parent) => LockHandle::with_parent(self.arc(), parent),
            None => self.handle(),
        };

        let shard_no = self.shard_of(collection, key);

        let (previous_id, previous_event) =
            match self.get_latest_event(collection, key, &lock_handle, LockType::Write)? {
                Some(found) => found,
                None => return Ok(INVALID_EVENT),
            };

        if previous_event.kind == EventKind::Deletion {
            return Ok(INVALID_EVENT);
        }

        // Object policies gate deletion too.
        if let Some(previous_version) =
            self.get_previous_version(shard_no, &previous_event, &lock_handle, LockType::Write)?
        {
            if let Some(policy) = previous_version.policy()? {
                let object = previous_version.value()?;
                if !self.check_object_policy(
                    &policy,
                    op_context,
                    collection,
                    key,
                    "",
                    OperationType::RemoveObject,
                    Some(&object),
                ) {
                    log::debug!("rejected remove because of object policy");
                    return Ok(INVALID_EVENT);
                }
            }

            // Deleted objects leave the secondary indexes.
            let old_value = previous_version.value()?;
            let col = self.get_collection(collection);
            for index in col.secondary_indexes() {
                index.remove(&old_value, key)?;
            }
        }

        let event_id =
            self.put_tombstone(op_context, collection, key, previous_id, &lock_handle, tx_ref)?;

        self.object_count.fetch_sub(1, Ordering::SeqCst);
        drop(lock_handle);

        if parent.is_none() {
            self.organize_ledger(shard_no)?;
        }
        Ok(event_id)
    }

    /// Fast feasibility check for a write inside a transaction's prepare
    /// phase: key shape plus collection and object policies.
    pub fn prepare_write(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        path: &str,
        op_type: OperationType,
        lock_handle: &LockHandle,
    ) -> CResult<bool> {
        if !Self::is_valid_key(key) {
            return Ok(false);
        }

        if !self.check_collection_policy(op_context, collection, key, path, op_type, Some(lock_handle))? {
            return Ok(false);
        }

        if let Some((eid, event)) =
            self.get_latest_event(collection, key, lock_handle, LockType::Write)?
        {
            let previous_version =
                self.get_previous_version(eid.shard, &event, lock_handle, LockType::Write)?;
            lock_handle.release_block(eid.shard, eid.block, LockType::Write);

            if let Some(previous) = previous_version {
                if let Some(policy) = previous.policy()? {
                    let object = previous.value()?;
                    if !self.check_object_policy(
                        &policy, op_context, collection, key, path, op_type, Some(&object),
                    ) {
                        return Ok(false);
                    }
                }
            }
        }

        Ok(true)
    }

    pub(crate) fn write_version(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        doc_in: &Value,
        path: &str,
        parent: Option<&LockHandle>,
        mode: WriteMode,
        tx_ref: Option<LedgerPos>,
    ) -> CResult<EventId> {
        if !Self::is_valid_key(key) {
            return Err(Error::InvalidArgument(format!("invalid key '{}'", key)));
        }

        let op_type = match mode {
            WriteMode::Replace => OperationType::PutObject,
            WriteMode::Merge => OperationType::AddToObject,
        };

        if !self.check_collection_policy(op_context, collection, key, path, op_type, parent)? {
            log::debug!("rejected write because of collection policy");
            return Ok(INVALID_EVENT);
        }

        let lock_handle = match parent {
            Some(parent) => LockHandle::with_parent(self.arc(), parent),
            None => self.handle(),
        };

        let shard_no = self.shard_of(collection, key);

        let mut previous_id = INVALID_EVENT;
        let mut previous_version: Option<Event> = None;
        let mut version_no: VersionNo = INITIAL_VERSION_NO;

        // The shard acquisition taken here is held until the handle drops,
        // so no other writer can interleave between read and append.
        if let Some((prev_id, prev_event)) =
            self.get_latest_event(collection, key, &lock_handle, LockType::Write)?
        {
            previous_id = prev_id;
            previous_version =
                self.get_previous_version(shard_no, &prev_event, &lock_handle, LockType::Write)?;

            if let Some(previous) = &previous_version {
                version_no = previous.version_no + 1;
            }
        }

        if let Some(previous) = &previous_version {
            if let Some(policy) = previous.policy()? {
                let object = previous.value()?;
                if !self.check_object_policy(
                    &policy,
                    op_context,
                    collection,
                    key,
                    path,
                    op_type,
                    Some(&object),
                ) {
                    log::debug!("rejected write because of object policy");
                    return Ok(INVALID_EVENT);
                }
            }
        }

        // Build the document the new version stores.
        let doc = if path.is_empty() && matches!(mode, WriteMode::Replace) {
            doc_in.clone()
        } else {
            let mut base = match &previous_version {
                Some(previous) => previous.value()?,
                None if path.is_empty() => Value::Null,
                None => {
                    // cannot address into an object that does not exist
                    return Ok(INVALID_EVENT);
                }
            };

            match mode {
                WriteMode::Replace => doc::insert_path(&mut base, path, doc_in.clone())?,
                WriteMode::Merge => doc::add_path(&mut base, path, doc_in.clone())?,
            }
            base
        };

        let eid = self.put_next_version(
            op_context,
            collection,
            key,
            &doc,
            version_no,
            previous_id,
            previous_version.as_ref(),
            &lock_handle,
            tx_ref,
        )?;

        lock_handle.release_block(shard_no, eid.block, LockType::Write);
        drop(lock_handle);

        if parent.is_none() {
            self.organize_ledger(shard_no)?;
        }
        Ok(eid)
    }

    /// Append the NewVersion event, maintain the indexes and fan updates
    /// out to triggers and downstream replicas. One shard write
    /// acquisition is left held for the caller to release.
    #[allow(clippy::too_many_arguments)]
    fn put_next_version(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        doc: &Value,
        version_no: VersionNo,
        previous_id: EventId,
        previous_version: Option<&Event>,
        lock_handle: &LockHandle,
        tx_ref: Option<LedgerPos>,
    ) -> CResult<EventId> {
        if !op_context.is_valid() {
            return Err(Error::Internal("cannot modify using invalid identity".into()));
        }

        let shard_no = self.shard_of(collection, key);
        let pending = lock_handle.get_pending_block(shard_no, LockType::Write)?;
        let col = self.get_collection(collection);

        if version_no == INITIAL_VERSION_NO {
            self.object_count.fetch_add(1, Ordering::SeqCst);
        } else if let Some(previous) = previous_version {
            // Re-index under the new projection.
            let old_value = previous.value()?;
            for index in col.secondary_indexes() {
                index.remove(&old_value, key)?;
            }
        }

        for index in col.secondary_indexes() {
            index.insert(doc, key)?;
        }

        let previous = previous_id.is_valid().then(|| (previous_id.block, previous_id.index));
        let mut event = Event::new_version(op_context.source(), previous, version_no, doc)?;
        event.tx_ref = tx_ref;

        let index = pending.insert(&event)?;
        pending.mark_dirty();
        pending.flush()?;

        let event_id = EventId::new(shard_no, pending.identifier(), index);

        let mut changes: Vec<IndexChange> = Vec::new();
        col.primary_index().insert(key, event_id, Some(&mut changes))?;

        for party in col.trigger_parties() {
            self.peers.notify_trigger(party, collection);
        }
        self.version_count.fetch_add(1, Ordering::SeqCst);

        self.send_index_updates_downstream(
            collection,
            changes,
            shard_no,
            pending.page_no(),
            pending.num_entries(),
        );

        Ok(event_id)
    }

    /// Append a Deletion event and point the primary index at it. Releases
    /// the pending-block acquisition it takes.
    fn put_tombstone(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        previous_id: EventId,
        lock_handle: &LockHandle,
        tx_ref: Option<LedgerPos>,
    ) -> CResult<EventId> {
        if !op_context.is_valid() {
            return Err(Error::Internal("cannot modify using invalid identity".into()));
        }

        let shard_no = self.shard_of(collection, key);
        let pending = lock_handle.get_pending_block(shard_no, LockType::Write)?;
        let col = self.get_collection(collection);

        let mut event =
            Event::deletion(op_context.source(), (previous_id.block, previous_id.index));
        event.tx_ref = tx_ref;

        let index = pending.insert(&event)?;
        pending.mark_dirty();
        pending.flush()?;

        let event_id = EventId::new(shard_no, pending.identifier(), index);

        let mut changes: Vec<IndexChange> = Vec::new();
        col.primary_index().insert(key, event_id, Some(&mut changes))?;

        for party in col.trigger_parties() {
            self.peers.notify_trigger(party, collection);
        }

        self.send_index_updates_downstream(
            collection,
            changes,
            shard_no,
            pending.page_no(),
            pending.num_entries(),
        );

        drop(pending);
        lock_handle.release_block(shard_no, event_id.block, LockType::Write);
        Ok(event_id)
    }

    /// Reserve the next `num` event ids on a shard without writing them.
    /// Transactions use this to stitch their ledger entry before applying.
    pub fn get_next_event_ids(
        &self,
        shard_no: ShardId,
        num: u16,
        lock_handle: &LockHandle,
    ) -> CResult<Vec<EventId>> {
        let pending = lock_handle.get_pending_block(shard_no, LockType::Write)?;
        let base = pending.num_entries();
        let block = pending.identifier();
        drop(pending);
        lock_handle.release_block(shard_no, block, LockType::Write);

        Ok((0..num).map(|i| EventId::new(shard_no, block, base + i)).collect())
    }

    /// Seal and rotate the shard's pending block once it has grown past
    /// the minimum block size. Runs after top-level write operations.
    pub fn organize_ledger(&self, shard_no: ShardId) -> CResult<()> {
        let shard = self.shard(shard_no);
        shard.lockable().write_lock();

        let result = (|| -> CResult<()> {
            let pending = shard.get_pending_block(LockType::Write)?;
            if pending.data_size() < MIN_BLOCK_SIZE {
                return Ok(());
            }

            pending.seal();
            pending.mark_dirty();
            pending.flush()?;
            drop(pending);

            let fresh = shard.generate_block()?;
            fresh.flush()?;
            Ok(())
        })();

        shard.lockable().write_unlock();
        result
    }

    // ------------------------------------------------------------------
    // Reads and queries
    // ------------------------------------------------------------------

    /// Does any event exist for the key? Tombstoned objects still "have"
    /// an entry in the primary index; use `get` for liveness.
    pub fn has_object(&self, collection: &str, key: &str) -> CResult<bool> {
        match self.try_get_collection(collection) {
            Some(col) => Ok(col.primary_index().get(key)?.is_some()),
            None => Ok(false),
        }
    }

    /// Fetch the current value of a key (optionally a path inside it).
    pub fn get(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        path: &str,
        parent: Option<&LockHandle>,
    ) -> CResult<Option<(EventId, Value)>> {
        let lock_handle = match parent {
            Some(parent) => LockHandle::with_parent(self.arc(), parent),
            None => self.handle(),
        };

        let (eid, event) = match self.get_latest_version(
            op_context,
            collection,
            key,
            path,
            &lock_handle,
            LockType::Read,
            OperationType::GetObject,
        )? {
            Some(found) => found,
            None => return Ok(None),
        };

        let value = event.value()?;
        lock_handle.release_block(eid.shard, eid.block, LockType::Read);

        if path.is_empty() {
            Ok(Some((eid, value)))
        } else {
            match doc::get_path(&value, path) {
                Some(sub) => Ok(Some((eid, sub.clone()))),
                None => Ok(None),
            }
        }
    }

    /// Check a predicate against the current value of `key[.path]`.
    pub fn check(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        path: &str,
        predicate: &Value,
        parent: Option<&LockHandle>,
    ) -> CResult<bool> {
        match self.get(op_context, collection, key, path, parent)? {
            Some((_, value)) => Ok(doc::matches_predicates(&value, predicate)),
            None => Ok(false),
        }
    }

    /// Iterate all versions of an object, newest first.
    pub fn iterate<'a>(
        &'a self,
        op_context: &'a OpContext,
        collection: &str,
        key: &str,
        path: &str,
        parent: Option<&'a LockHandle<'a>>,
    ) -> ObjectIterator<'a> {
        ObjectIterator::new(self, op_context, collection, key, path, parent)
    }

    /// How many times `principal` has written to the object.
    pub fn count_writes(
        &self,
        op_context: &OpContext,
        principal: &str,
        collection: &str,
        key: &str,
        parent: Option<&LockHandle>,
    ) -> CResult<u32> {
        let mut iter = self.iterate(op_context, collection, key, "", parent);
        let mut count = 0;

        while let Some((_, event)) = iter.next_handle()? {
            if event.source == principal {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Scan a collection for objects matching the predicates.
    ///
    /// Secondary indexes whose paths the predicate covers (with equality
    /// or `$in` only) seed the candidate set, smallest estimate first;
    /// remaining indexes intersect. Without an applicable index this is a
    /// linear scan over the primary index.
    pub fn find<'a>(
        &'a self,
        op_context: &'a OpContext,
        collection: &str,
        predicates: Value,
        limit: Option<usize>,
        parent: Option<&'a LockHandle<'a>>,
    ) -> CResult<ObjectListIterator<'a>> {
        let col = match self.try_get_collection(collection) {
            Some(col) => col,
            None => {
                return Ok(ObjectListIterator::empty(self, op_context, collection, predicates, parent))
            }
        };

        let mut applicable = Vec::new();
        for index in col.secondary_indexes() {
            if index.matches_query(&predicates) {
                let estimate = index.estimate_value_count(&predicates)?;
                applicable.push((estimate, index));
            }
        }

        if applicable.is_empty() {
            log::debug!("find on '{}' falls back to a linear scan", collection);
            return Ok(ObjectListIterator::linear_scan(
                self, op_context, collection, predicates, limit, col, parent,
            ));
        }

        // Smallest estimated result seeds the set, the rest intersect.
        applicable.sort_by_key(|(estimate, _)| *estimate);

        let mut candidates = std::collections::HashSet::new();
        let mut first = true;
        for (_, index) in &applicable {
            let op = if first {
                crate::index::SetOperation::Union
            } else {
                crate::index::SetOperation::Intersect
            };
            index.find(&predicates, &mut candidates, op)?;
            first = false;
        }

        log::debug!(
            "find on '{}' merged {} candidate keys from {} indexes",
            collection,
            candidates.len(),
            applicable.len()
        );

        let mut keys: Vec<String> = candidates.into_iter().collect();
        keys.sort();
        Ok(ObjectListIterator::with_keys(self, op_context, collection, predicates, limit, keys, parent))
    }

    /// Count objects matching the predicates.
    pub fn count_objects(
        &self,
        op_context: &OpContext,
        collection: &str,
        predicates: Value,
    ) -> CResult<u32> {
        let mut iter = self.find(op_context, collection, predicates, None, None)?;
        let mut count = 0;
        while iter.next_entry()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Difference between two versions of an object.
    pub fn diff(
        &self,
        op_context: &OpContext,
        collection: &str,
        key: &str,
        version1: VersionNo,
        version2: VersionNo,
    ) -> CResult<Option<Value>> {
        let mut iter = self.iterate(op_context, collection, key, "", None);

        let mut first: Option<Value> = None;
        let mut second: Option<Value> = None;

        while let Some((_, event)) = iter.next_handle()? {
            if event.version_no == version1 {
                first = Some(event.value()?);
            }
            if event.version_no == version2 {
                second = Some(event.value()?);
            }
            if first.is_some() && second.is_some() {
                break;
            }
        }

        match (first, second) {
            (Some(a), Some(b)) => Ok(Some(doc::diff(&a, &b))),
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Index management
    // ------------------------------------------------------------------

    /// Create a secondary index and backfill it from the collection's
    /// current contents.
    pub fn create_index(&self, collection: &str, name: &str, paths: Vec<String>) -> CResult<bool> {
        let col = self.get_collection(collection);
        let index = match col.create_index(name, paths) {
            Some(index) => index,
            None => return Ok(false),
        };

        let empty_context = OpContext::invalid();
        let mut cursor = col.primary_index().cursor(0);
        while let Some((key, _)) = cursor.next_entry()? {
            let lock_handle = self.handle();
            if let Some((eid, event)) = self.get_latest_version(
                &empty_context,
                collection,
                &key,
                "",
                &lock_handle,
                LockType::Read,
                OperationType::GetObject,
            )? {
                let value = event.value()?;
                lock_handle.release_block(eid.shard, eid.block, LockType::Read);
                index.insert(&value, &key)?;
            }
        }

        Ok(true)
    }

    pub fn drop_index(&self, collection: &str, name: &str) -> CResult<bool> {
        match self.try_get_collection(collection) {
            Some(col) => col.drop_index(name),
            None => Ok(false),
        }
    }

    /// Tombstone every live object in the collection, in batches so locks
    /// and oversized blocks get recycled along the way.
    pub fn clear(&self, op_context: &OpContext, collection: &str) -> CResult<bool> {
        let col = match self.try_get_collection(collection) {
            Some(col) => col,
            None => return Ok(true),
        };

        if !self.check_collection_policy(op_context, collection, "", "", OperationType::Clear, None)? {
            return Ok(false);
        }

        let mut start_bucket = 0;
        loop {
            let mut cursor = col.primary_index().cursor(start_bucket);
            let mut batch = Vec::with_capacity(CLEAR_BATCH_SIZE);
            while batch.len() < CLEAR_BATCH_SIZE {
                match cursor.next_entry()? {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }
            let done = batch.len() < CLEAR_BATCH_SIZE;
            start_bucket = cursor.position();
            drop(cursor);

            {
                let lock_handle = self.handle();

                for (key, previous_id) in batch {
                    let previous = self.get_event(&previous_id, &lock_handle, LockType::Write)?;
                    if previous.kind == EventKind::Deletion {
                        continue;
                    }

                    if let Some(previous_version) = self.get_previous_version(
                        previous_id.shard,
                        &previous,
                        &lock_handle,
                        LockType::Write,
                    )? {
                        let old_value = previous_version.value()?;
                        for index in col.secondary_indexes() {
                            index.remove(&old_value, &key)?;
                        }
                    }

                    self.put_tombstone(op_context, collection, &key, previous_id, &lock_handle, None)?;
                    self.object_count.fetch_sub(1, Ordering::SeqCst);
                }
            }

            for shard_no in 0..NUM_SHARDS {
                self.organize_ledger(shard_no)?;
            }

            if done {
                return Ok(true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Witness digests
    // ------------------------------------------------------------------

    /// Build the digest content for a witness over the given events.
    pub fn witness_digest(&self, events: &[EventId]) -> CResult<Value> {
        let mut records = Vec::with_capacity(events.len());

        for eid in events {
            let lock_handle = self.handle();

            let event = self.get_event(eid, &lock_handle, LockType::Read)?;
            let previous =
                self.get_previous_event(eid.shard, &event, &lock_handle, LockType::Read)?;

            let mut record = serde_json::json!({
                crate::witness::SHARD_FIELD_NAME: eid.shard,
                crate::witness::BLOCK_FIELD_NAME: eid.block,
                crate::witness::INDEX_FIELD_NAME: eid.index,
                "source": event.source,
            });

            match (&event.kind, &previous) {
                (EventKind::Deletion, _) => {
                    record["type"] = Value::from("deletion");
                }
                (EventKind::NewVersion, Some(prev)) if prev.kind != EventKind::Deletion => {
                    record["type"] = Value::from("change");
                    record["diff"] = doc::diff(&prev.value()?, &event.value()?);
                }
                (EventKind::NewVersion, _) => {
                    record["type"] = Value::from("creation");
                    record["value"] = event.value()?;
                }
                _ => {
                    log::error!("unknown pair of object events in witness digest");
                }
            }

            records.push(record);
        }

        Ok(Value::Array(records))
    }

    // ------------------------------------------------------------------
    // Triggers and replication
    // ------------------------------------------------------------------

    pub fn set_trigger(&self, collection: &str, party: crate::policy::IdentityUid) -> bool {
        self.get_collection(collection).set_trigger(party);
        true
    }

    pub fn unset_trigger(&self, collection: &str, party: crate::policy::IdentityUid) -> bool {
        match self.try_get_collection(collection) {
            Some(col) => col.unset_trigger(party),
            None => false,
        }
    }

    /// Drop every trigger a disconnected party registered.
    pub fn remove_triggers_for(&self, party: crate::policy::IdentityUid) {
        let collections: Vec<_> = self.collections.read().unwrap().values().cloned().collect();
        for col in collections {
            col.unset_trigger(party);
        }
    }

    fn send_index_updates_downstream(
        &self,
        collection: &str,
        changes: Vec<IndexChange>,
        shard: ShardId,
        invalidated_page: crate::types::PageNo,
        pending_entries: crate::types::BlockIndex,
    ) {
        if self.peers.downstream_set().is_empty() {
            return;
        }

        let update = IndexUpdate {
            collection: collection.to_string(),
            changes,
            shard,
            invalidated_page,
            pending_entries,
        };
        self.peers.push_index_update(&update);
    }

    /// Downstream replica: apply a pushed index update from the upstream.
    pub fn apply_index_update(&self, update: &IndexUpdate) -> CResult<()> {
        let col = self.get_collection(&update.collection);
        for change in &update.changes {
            col.primary_index().apply_change(change);
        }

        if update.invalidated_page != INVALID_PAGE_NO {
            let shard = self.shard(update.shard);
            shard.lockable().write_lock();
            shard.discard_cached_block(update.invalidated_page);
            shard.set_pending_block(update.invalidated_page, update.pending_entries);
            shard.lockable().write_unlock();
        }

        Ok(())
    }

    /// Drop cached pending blocks, e.g. after reconnecting to an upstream.
    pub fn clear_cached_blocks(&self) -> CResult<()> {
        for shard in &self.shards {
            shard.reload_pending_block()?;
        }
        Ok(())
    }
}

/// How `write_version` combines the incoming document with the current
/// value at the addressed path.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Replace,
    Merge,
}
