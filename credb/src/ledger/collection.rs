//! A named logical grouping of objects: one primary index, any number of
//! secondary indexes, and the set of remote parties subscribed to
//! mutation triggers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::CResult;
use crate::index::{PrimaryIndex, SecondaryIndex};
use crate::page::BufferManager;
use crate::policy::IdentityUid;

pub struct Collection {
    name: String,
    primary: PrimaryIndex,
    secondary: RwLock<HashMap<String, Arc<SecondaryIndex>>>,
    triggers: Mutex<HashSet<IdentityUid>>,
    buffer: Arc<BufferManager>,
}

impl Collection {
    pub fn new(buffer: Arc<BufferManager>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            primary: PrimaryIndex::new(buffer.clone(), name),
            secondary: RwLock::new(HashMap::new()),
            triggers: Mutex::new(HashSet::new()),
            buffer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_index(&self) -> &PrimaryIndex {
        &self.primary
    }

    /// Register a new secondary index. Returns false if the name is taken.
    /// The caller is responsible for backfilling existing objects.
    pub fn create_index(&self, name: &str, paths: Vec<String>) -> Option<Arc<SecondaryIndex>> {
        let mut indexes = self.secondary.write().unwrap();
        if indexes.contains_key(name) {
            return None;
        }

        let index = Arc::new(SecondaryIndex::new(self.buffer.clone(), name, paths));
        indexes.insert(name.to_string(), index.clone());
        Some(index)
    }

    pub fn drop_index(&self, name: &str) -> CResult<bool> {
        let index = self.secondary.write().unwrap().remove(name);
        match index {
            Some(index) => {
                index.clear()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn secondary_indexes(&self) -> Vec<Arc<SecondaryIndex>> {
        self.secondary.read().unwrap().values().cloned().collect()
    }

    pub fn set_trigger(&self, party: IdentityUid) {
        self.triggers.lock().unwrap().insert(party);
    }

    /// Returns whether the party had a trigger registered.
    pub fn unset_trigger(&self, party: IdentityUid) -> bool {
        self.triggers.lock().unwrap().remove(&party)
    }

    pub fn trigger_parties(&self) -> Vec<IdentityUid> {
        self.triggers.lock().unwrap().iter().copied().collect()
    }
}
