//! A paged multi map from 64-bit hashes to sets of object keys. Backs the
//! secondary indexes: the key is a hash of the indexed document
//! projection, the values are the primary keys carrying that projection.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::page::{BufferManager, PageHandle, PageType};
use crate::sync::RwLockable;
use crate::types::PageNo;

pub const NUM_BUCKETS: usize = 8192;
pub const NUM_STRIPES: usize = 64;
pub const MAX_NODE_SIZE: usize = 1024;

/// How result sets combine across indexes during query planning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOperation {
    Union,
    Intersect,
}

#[derive(Serialize, Deserialize)]
struct NodeRepr {
    successor: PageNo,
    entries: BTreeMap<i64, BTreeSet<String>>,
}

pub struct MultiMapNode {
    page_no: PageNo,
    state: RwLock<NodeRepr>,
}

impl MultiMapNode {
    fn empty(page_no: PageNo) -> Self {
        Self { page_no, state: RwLock::new(NodeRepr { successor: 0, entries: BTreeMap::new() }) }
    }

    fn successor(&self) -> PageNo {
        self.state.read().unwrap().successor
    }

    fn link_successor(&self, page_no: PageNo) {
        self.state.write().unwrap().successor = page_no;
    }

    fn entry_bytes(entries: &BTreeMap<i64, BTreeSet<String>>) -> usize {
        entries
            .iter()
            .map(|(_, set)| 8 + set.iter().map(|v| v.len()).sum::<usize>())
            .sum()
    }

    /// Insert unless full. Nodes already holding the key accept new set
    /// members regardless of the budget, so sets stay whole per node.
    fn try_insert(&self, key: i64, value: &str) -> CResult<bool> {
        let mut state = self.state.write().unwrap();

        if let Some(set) = state.entries.get_mut(&key) {
            set.insert(value.to_string());
            return Ok(true);
        }

        let projected = Self::entry_bytes(&state.entries) + 8 + value.len();
        if !state.entries.is_empty() && projected > MAX_NODE_SIZE {
            return Ok(false);
        }

        state
            .entries
            .entry(key)
            .or_insert_with(BTreeSet::new)
            .insert(value.to_string());
        Ok(true)
    }

    fn remove(&self, key: i64, value: &str) -> bool {
        let mut state = self.state.write().unwrap();
        if let Some(set) = state.entries.get_mut(&key) {
            let removed = set.remove(value);
            if set.is_empty() {
                state.entries.remove(&key);
            }
            return removed;
        }
        false
    }

    fn collect(&self, key: i64, out: &mut HashSet<String>) {
        let state = self.state.read().unwrap();
        if let Some(set) = state.entries.get(&key) {
            out.extend(set.iter().cloned());
        }
    }

    fn count(&self, key: i64) -> usize {
        let state = self.state.read().unwrap();
        state.entries.get(&key).map(|s| s.len()).unwrap_or(0)
    }
}

impl PageType for MultiMapNode {
    fn from_bytes(page_no: PageNo, bytes: &[u8]) -> CResult<Self> {
        Ok(Self { page_no, state: RwLock::new(bincode::deserialize(bytes)?) })
    }

    fn to_bytes(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(&*self.state.read().unwrap())?)
    }

    fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>() + Self::entry_bytes(&self.state.read().unwrap().entries)
    }
}

/// i64 hash -> set of primary keys.
pub struct MultiMap {
    name: String,
    buffer: Arc<BufferManager>,
    stripes: Vec<RwLockable>,
    buckets: Vec<Mutex<PageNo>>,
    size: AtomicUsize,
}

impl MultiMap {
    pub fn new(buffer: Arc<BufferManager>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            buffer,
            stripes: (0..NUM_STRIPES).map(|_| RwLockable::new()).collect(),
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(0)).collect(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of (key, value) pairs across all sets.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn bucket_of(key: i64) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize % NUM_BUCKETS
    }

    fn stripe_of(bucket: usize) -> usize {
        bucket % NUM_STRIPES
    }

    pub fn insert(&self, key: i64, value: &str) -> CResult<()> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.write_lock();
        let result = self.insert_locked(bucket, key, value);
        stripe.write_unlock();
        result
    }

    fn insert_locked(&self, bucket: usize, key: i64, value: &str) -> CResult<()> {
        let mut root = self.buckets[bucket].lock().unwrap();

        let mut node = if *root == 0 {
            let fresh = self.buffer.new_page(MultiMapNode::empty)?;
            *root = fresh.page_no();
            fresh
        } else {
            self.buffer.get_page::<MultiMapNode>(*root)?
        };

        loop {
            if node.try_insert(key, value)? {
                node.mark_dirty();
                node.flush()?;
                self.size.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }

            let succ = node.successor();
            let next = if succ == 0 {
                let fresh = self.buffer.new_page(MultiMapNode::empty)?;
                node.link_successor(fresh.page_no());
                node.mark_dirty();
                node.flush()?;
                fresh
            } else {
                self.buffer.get_page::<MultiMapNode>(succ)?
            };
            node = next;
        }
    }

    pub fn remove(&self, key: i64, value: &str) -> CResult<bool> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.write_lock();
        let result = self.walk(bucket, |node| {
            if node.remove(key, value) {
                node.mark_dirty();
                node.flush()?;
                self.size.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(true))
            } else {
                Ok(None)
            }
        });
        stripe.write_unlock();
        Ok(result?.unwrap_or(false))
    }

    /// Collect the set stored under `key` into `out`, either as a union or
    /// by intersecting with what is already there.
    pub fn find(&self, key: i64, out: &mut HashSet<String>, op: SetOperation) -> CResult<()> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.read_lock();
        let result = (|| -> CResult<()> {
            let mut matches = HashSet::new();
            self.walk(bucket, |node| {
                node.collect(key, &mut matches);
                Ok(None::<()>)
            })?;

            match op {
                SetOperation::Union => out.extend(matches),
                SetOperation::Intersect => out.retain(|v| matches.contains(v)),
            }
            Ok(())
        })();
        stripe.read_unlock();
        result
    }

    pub fn estimate_value_count(&self, key: i64) -> CResult<usize> {
        let bucket = Self::bucket_of(key);
        let stripe = &self.stripes[Self::stripe_of(bucket)];

        stripe.read_lock();
        let mut count = 0;
        let result = self.walk(bucket, |node| {
            count += node.count(key);
            Ok(None::<()>)
        });
        stripe.read_unlock();
        result?;
        Ok(count)
    }

    /// Drop every node page. Used when an index is dropped or rebuilt.
    pub fn clear(&self) -> CResult<()> {
        for bucket in 0..NUM_BUCKETS {
            let stripe = &self.stripes[Self::stripe_of(bucket)];
            stripe.write_lock();

            let result = (|| -> CResult<()> {
                let mut root = self.buckets[bucket].lock().unwrap();
                let mut page_no = *root;
                *root = 0;

                while page_no != 0 {
                    let next = self.buffer.get_page::<MultiMapNode>(page_no)?.successor();
                    self.buffer.delete_page(page_no)?;
                    page_no = next;
                }
                Ok(())
            })();

            stripe.write_unlock();
            result?;
        }

        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Walk the node chain of a bucket until the visitor returns a value.
    fn walk<T>(
        &self,
        bucket: usize,
        mut visit: impl FnMut(&PageHandle<MultiMapNode>) -> CResult<Option<T>>,
    ) -> CResult<Option<T>> {
        let root = *self.buckets[bucket].lock().unwrap();
        if root == 0 {
            return Ok(None);
        }

        let mut node = self.buffer.get_page::<MultiMapNode>(root)?;
        loop {
            if let Some(result) = visit(&node)? {
                return Ok(Some(result));
            }

            let succ = node.successor();
            if succ == 0 {
                return Ok(None);
            }
            node = self.buffer.get_page::<MultiMapNode>(succ)?;
        }
    }
}

/// Stable hash used to key secondary indexes by document projection.
pub fn hash_projection(value: &serde_json::Value) -> i64 {
    let mut hasher = DefaultHasher::new();
    // Serialize through canonical JSON text so logically equal projections
    // hash equally.
    value.to_string().hash(&mut hasher);
    hasher.finish() as i64
}
