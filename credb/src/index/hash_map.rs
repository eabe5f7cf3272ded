//! The primary index: an open-hash map from string keys to the event id of
//! the key's latest event.
//!
//! Buckets are paged: each bucket references a chain of nodes, every node
//! holding entries up to a byte budget. Buckets share stripe locks. Nodes
//! and buckets carry version counters that increase with every mutation,
//! so a downstream replica can detect dropped or stale updates.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::page::{BufferManager, PageHandle, PageType, Versioned};
use crate::sync::RwLockable;
use crate::types::{EventId, PageNo};

pub const NUM_BUCKETS: usize = 8192;
pub const NUM_STRIPES: usize = 64;

/// Nodes stay under roughly this many bytes of entry data.
pub const MAX_NODE_SIZE: usize = 1024;

/// A bucket's change record, shipped to downstream replicas so they can
/// apply the mutation and detect dropped updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub bucket: u32,
    pub version: u32,
    pub root_page: PageNo,
}

#[derive(Clone, Copy, Default)]
struct BucketMeta {
    page_no: PageNo,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct NodeRepr {
    version: u32,
    successor: PageNo,
    successor_version: u32,
    entries: Vec<(String, EventId)>,
}

enum Upsert {
    Inserted,
    Updated,
    Full,
}

/// One paged node in a bucket chain.
pub struct MapNode {
    page_no: PageNo,
    state: RwLock<NodeRepr>,
}

impl MapNode {
    fn empty(page_no: PageNo) -> Self {
        Self {
            page_no,
            state: RwLock::new(NodeRepr {
                version: 1,
                successor: 0,
                successor_version: 0,
                entries: Vec::new(),
            }),
        }
    }

    fn get(&self, key: &str) -> Option<EventId> {
        let state = self.state.read().unwrap();
        state.entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    fn successor(&self) -> (PageNo, u32) {
        let state = self.state.read().unwrap();
        (state.successor, state.successor_version)
    }

    fn entries(&self) -> Vec<(String, EventId)> {
        self.state.read().unwrap().entries.clone()
    }

    fn entry_bytes(entries: &[(String, EventId)]) -> usize {
        entries.iter().map(|(k, _)| k.len() + std::mem::size_of::<EventId>()).sum()
    }

    /// Insert or update. Returns `Full` when a new entry does not fit;
    /// an empty node accepts any entry so chains always make progress.
    fn upsert(&self, key: &str, value: EventId) -> Upsert {
        let mut state = self.state.write().unwrap();

        if let Some(slot) = state.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
            return Upsert::Updated;
        }

        let projected = Self::entry_bytes(&state.entries)
            + key.len()
            + std::mem::size_of::<EventId>();
        if !state.entries.is_empty() && projected > MAX_NODE_SIZE {
            return Upsert::Full;
        }

        state.entries.push((key.to_string(), value));
        Upsert::Inserted
    }

    fn remove(&self, key: &str) -> bool {
        let mut state = self.state.write().unwrap();
        let before = state.entries.len();
        state.entries.retain(|(k, _)| k != key);
        state.entries.len() != before
    }

    fn link_successor(&self, page_no: PageNo, version: u32) {
        let mut state = self.state.write().unwrap();
        state.successor = page_no;
        state.successor_version = version;
    }

    fn set_successor_version(&self, version: u32) {
        self.state.write().unwrap().successor_version = version;
    }

    fn increment_version(&self) -> u32 {
        let mut state = self.state.write().unwrap();
        state.version += 1;
        state.version
    }
}

impl PageType for MapNode {
    fn from_bytes(page_no: PageNo, bytes: &[u8]) -> CResult<Self> {
        Ok(Self { page_no, state: RwLock::new(bincode::deserialize(bytes)?) })
    }

    fn to_bytes(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(&*self.state.read().unwrap())?)
    }

    fn byte_size(&self) -> usize {
        let state = self.state.read().unwrap();
        std::mem::size_of::<Self>() + Self::entry_bytes(&state.entries)
    }
}

impl Versioned for MapNode {
    fn page_version(&self) -> u32 {
        self.state.read().unwrap().version
    }
}

/// String key -> latest event id, paged and striped.
pub struct PrimaryIndex {
    name: String,
    buffer: Arc<BufferManager>,
    stripes: Vec<RwLockable>,
    buckets: Vec<Mutex<BucketMeta>>,
    size: AtomicUsize,
}

impl PrimaryIndex {
    pub fn new(buffer: Arc<BufferManager>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            buffer,
            stripes: (0..NUM_STRIPES).map(|_| RwLockable::new()).collect(),
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(BucketMeta::default())).collect(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries in the map.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn bucket_of(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize % NUM_BUCKETS
    }

    fn stripe_of(bucket: usize) -> usize {
        bucket % NUM_STRIPES
    }

    pub fn get(&self, key: &str) -> CResult<Option<EventId>> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.read_lock();
        let result = self.get_locked(bucket, key);
        stripe.read_unlock();
        result
    }

    fn get_locked(&self, bucket: usize, key: &str) -> CResult<Option<EventId>> {
        let meta = *self.buckets[bucket].lock().unwrap();
        if meta.page_no == 0 {
            return Ok(None);
        }

        let mut node = self.buffer.get_page_versioned::<MapNode>(meta.page_no, meta.version)?;
        loop {
            if let Some(value) = node.get(key) {
                return Ok(Some(value));
            }

            let (succ, succ_version) = node.successor();
            if succ == 0 {
                return Ok(None);
            }
            node = self.buffer.get_page_versioned::<MapNode>(succ, succ_version)?;
        }
    }

    /// Insert or update an entry. Emits a change record for downstream
    /// replicas when `changes` is given.
    pub fn insert(&self, key: &str, value: EventId, changes: Option<&mut Vec<IndexChange>>) -> CResult<()> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.write_lock();
        let result = self.insert_locked(bucket, key, value, changes);
        stripe.write_unlock();
        result
    }

    fn insert_locked(
        &self,
        bucket: usize,
        key: &str,
        value: EventId,
        changes: Option<&mut Vec<IndexChange>>,
    ) -> CResult<()> {
        let mut meta = self.buckets[bucket].lock().unwrap();

        let mut nodes: Vec<PageHandle<MapNode>> = Vec::new();
        if meta.page_no == 0 {
            let root = self.buffer.new_page(MapNode::empty)?;
            meta.page_no = root.page_no();
            meta.version = 0; // bumped below
            nodes.push(root);
        } else {
            nodes.push(self.buffer.get_page_versioned::<MapNode>(meta.page_no, meta.version)?);
        }

        let mut inserted_new = false;
        loop {
            let node = match nodes.last() {
                Some(node) => node,
                None => return Err(Error::Internal("empty node chain".into())),
            };

            match node.upsert(key, value) {
                Upsert::Inserted => {
                    inserted_new = true;
                    break;
                }
                Upsert::Updated => break,
                Upsert::Full => {
                    let (succ, succ_version) = node.successor();
                    let next = if succ == 0 {
                        let fresh = self.buffer.new_page(MapNode::empty)?;
                        node.link_successor(fresh.page_no(), 0); // version set below
                        fresh
                    } else {
                        self.buffer.get_page_versioned::<MapNode>(succ, succ_version)?
                    };
                    nodes.push(next);
                }
            }
        }

        // Bump versions bottom-up so every node's successor expectation and
        // the bucket's root expectation stay in sync.
        let mut child_version: Option<u32> = None;
        for node in nodes.iter().rev() {
            if let Some(version) = child_version {
                node.set_successor_version(version);
            }
            let version = node.increment_version();
            node.mark_dirty();
            node.flush()?;
            child_version = Some(version);
        }

        let root_version =
            child_version.ok_or_else(|| Error::Internal("empty node chain".into()))?;
        meta.version = root_version;

        if inserted_new {
            self.size.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(changes) = changes {
            changes.push(IndexChange {
                bucket: bucket as u32,
                version: root_version,
                root_page: meta.page_no,
            });
        }

        Ok(())
    }

    /// Remove an entry. The primary index only shrinks when a collection is
    /// dropped wholesale; removal support exists for index maintenance.
    pub fn remove(&self, key: &str) -> CResult<bool> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.write_lock();
        let result = self.remove_locked(bucket, key);
        stripe.write_unlock();
        result
    }

    fn remove_locked(&self, bucket: usize, key: &str) -> CResult<bool> {
        let mut meta = self.buckets[bucket].lock().unwrap();
        if meta.page_no == 0 {
            return Ok(false);
        }

        let mut nodes =
            vec![self.buffer.get_page_versioned::<MapNode>(meta.page_no, meta.version)?];
        loop {
            let node = match nodes.last() {
                Some(node) => node,
                None => return Err(Error::Internal("empty node chain".into())),
            };

            if node.remove(key) {
                break;
            }

            let (succ, succ_version) = node.successor();
            if succ == 0 {
                return Ok(false);
            }
            nodes.push(self.buffer.get_page_versioned::<MapNode>(succ, succ_version)?);
        }

        let mut child_version: Option<u32> = None;
        for node in nodes.iter().rev() {
            if let Some(version) = child_version {
                node.set_successor_version(version);
            }
            let version = node.increment_version();
            node.mark_dirty();
            node.flush()?;
            child_version = Some(version);
        }
        if let Some(root_version) = child_version {
            meta.version = root_version;
        }

        self.size.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Replica side: adopt a pushed bucket change. The next lookup fetches
    /// the root with the new expected version, reloading (and, on remote
    /// stores, waiting) until the upstream write is visible.
    pub fn apply_change(&self, change: &IndexChange) {
        let bucket = change.bucket as usize % NUM_BUCKETS;
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.write_lock();
        {
            let mut meta = self.buckets[bucket].lock().unwrap();
            meta.page_no = change.root_page;
            meta.version = change.version;
        }
        stripe.write_unlock();
    }

    /// Current version of a bucket, as a downstream would need to expect.
    pub fn bucket_version(&self, bucket: u32) -> u32 {
        self.buckets[bucket as usize % NUM_BUCKETS].lock().unwrap().version
    }

    /// Iterate all entries starting at `start_bucket`. The cursor reads one
    /// bucket at a time under its stripe lock and never holds locks between
    /// calls.
    pub fn cursor(&self, start_bucket: usize) -> Cursor<'_> {
        Cursor { index: self, bucket: start_bucket, pending: VecDeque::new() }
    }

    pub(crate) fn bucket_entries(&self, bucket: usize) -> CResult<Vec<(String, EventId)>> {
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.read_lock();
        let result = (|| {
            let meta = *self.buckets[bucket].lock().unwrap();
            if meta.page_no == 0 {
                return Ok(Vec::new());
            }

            let mut out = Vec::new();
            let mut node =
                self.buffer.get_page_versioned::<MapNode>(meta.page_no, meta.version)?;
            loop {
                out.extend(node.entries());
                let (succ, succ_version) = node.successor();
                if succ == 0 {
                    return Ok(out);
                }
                node = self.buffer.get_page_versioned::<MapNode>(succ, succ_version)?;
            }
        })();
        stripe.read_unlock();
        result
    }
}

/// Cursor over the whole map, bucket by bucket.
pub struct Cursor<'a> {
    index: &'a PrimaryIndex,
    bucket: usize,
    pending: VecDeque<(String, EventId)>,
}

impl<'a> Cursor<'a> {
    pub fn next_entry(&mut self) -> CResult<Option<(String, EventId)>> {
        while self.pending.is_empty() && self.bucket < NUM_BUCKETS {
            let entries = self.index.bucket_entries(self.bucket)?;
            self.bucket += 1;
            self.pending.extend(entries);
        }
        Ok(self.pending.pop_front())
    }

    /// The bucket the cursor will read next; lets long-running scans resume
    /// after dropping the cursor.
    pub fn position(&self) -> usize {
        self.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemoryStore;
    use crate::types::EventId;

    fn setup() -> PrimaryIndex {
        let buffer = BufferManager::new(Arc::new(MemoryStore::new()), "test", 1 << 22);
        PrimaryIndex::new(buffer, "primary")
    }

    fn eid(n: u32) -> EventId {
        EventId::new(1, n, 0)
    }

    #[test]
    fn insert_get_update() -> CResult<()> {
        let index = setup();

        assert_eq!(index.get("foo")?, None);
        index.insert("foo", eid(1), None)?;
        assert_eq!(index.get("foo")?, Some(eid(1)));

        index.insert("foo", eid(2), None)?;
        assert_eq!(index.get("foo")?, Some(eid(2)));
        assert_eq!(index.size(), 1);
        Ok(())
    }

    #[test]
    fn node_chaining_past_the_size_limit() -> CResult<()> {
        let index = setup();

        // Long keys overflow a single 1 KiB node quickly. Aim everything at
        // whatever bucket key 0 maps to by simply inserting many keys; at
        // least one bucket must chain.
        let count = 600;
        for i in 0..count {
            let key = format!("object-{:0>60}", i);
            index.insert(&key, eid(i as u32 + 1), None)?;
        }

        for i in 0..count {
            let key = format!("object-{:0>60}", i);
            assert_eq!(index.get(&key)?, Some(eid(i as u32 + 1)));
        }
        assert_eq!(index.size(), count);
        Ok(())
    }

    #[test]
    fn change_records_carry_increasing_versions() -> CResult<()> {
        let index = setup();
        let mut changes = Vec::new();

        index.insert("a", eid(1), Some(&mut changes))?;
        index.insert("a", eid(2), Some(&mut changes))?;

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].bucket, changes[1].bucket);
        assert!(changes[1].version > changes[0].version);
        assert_eq!(index.bucket_version(changes[1].bucket), changes[1].version);
        Ok(())
    }

    #[test]
    fn cursor_sees_every_entry() -> CResult<()> {
        let index = setup();
        for i in 0..100 {
            index.insert(&format!("k{}", i), eid(i + 1), None)?;
        }

        let mut cursor = index.cursor(0);
        let mut seen = std::collections::HashSet::new();
        while let Some((key, _)) = cursor.next_entry()? {
            seen.insert(key);
        }
        assert_eq!(seen.len(), 100);
        Ok(())
    }

    #[test]
    fn remove_entry() -> CResult<()> {
        let index = setup();
        index.insert("a", eid(1), None)?;
        index.insert("b", eid(2), None)?;

        assert!(index.remove("a")?);
        assert!(!index.remove("a")?);
        assert_eq!(index.get("a")?, None);
        assert_eq!(index.get("b")?, Some(eid(2)));
        assert_eq!(index.size(), 1);
        Ok(())
    }

    #[test]
    fn apply_change_updates_expectation() -> CResult<()> {
        let index = setup();
        let mut changes = Vec::new();
        index.insert("a", eid(1), Some(&mut changes))?;

        let change = changes[0];
        index.apply_change(&change);
        assert_eq!(index.bucket_version(change.bucket), change.version);
        assert_eq!(index.get("a")?, Some(eid(1)));
        Ok(())
    }
}
