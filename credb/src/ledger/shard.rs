//! A shard owns one slice of the key space: its reader/writer lock, the
//! identifier of its current pending block, and nothing else that the
//! buffer manager does not already cache.

use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::page::{BufferManager, PageHandle};
use crate::sync::{LockType, RwLockable};
use crate::types::{BlockId, BlockIndex, PageNo, ShardId};

use super::block::Block;

pub struct Shard {
    identifier: ShardId,
    buffer: Arc<BufferManager>,
    lockable: RwLockable,
    state: Mutex<ShardState>,
}

struct ShardState {
    pending_block_id: PageNo,

    /// Entry count the upstream claims for the pending block. Replicas use
    /// it to wait for in-flight pushes.
    num_pending_events: BlockIndex,
}

impl Shard {
    pub fn new(identifier: ShardId, buffer: Arc<BufferManager>) -> CResult<Self> {
        let shard = Self {
            identifier,
            buffer,
            lockable: RwLockable::new(),
            state: Mutex::new(ShardState { pending_block_id: 0, num_pending_events: 0 }),
        };
        shard.generate_block()?;
        Ok(shard)
    }

    pub fn identifier(&self) -> ShardId {
        self.identifier
    }

    pub fn lockable(&self) -> &RwLockable {
        &self.lockable
    }

    pub fn pending_block_id(&self) -> BlockId {
        self.state.lock().unwrap().pending_block_id
    }

    /// Fetch a block of this shard. The caller must already hold the shard
    /// lock with `lock_type`.
    ///
    /// On a downstream replica the upstream may still be writing the page,
    /// so we release the shard lock and reload until the page catches up.
    pub fn get_block(&self, block: BlockId, lock_type: LockType) -> CResult<PageHandle<Block>> {
        let page_no: PageNo = block;
        let pending_id = self.pending_block_id();

        if page_no == pending_id {
            if self.buffer.is_remote() {
                self.lockable.unlock(lock_type);
                let result = self.wait_for_pending_entries(page_no);
                self.lockable.lock(lock_type);
                result
            } else {
                // The pending block cannot be evicted behind our back.
                self.buffer.get_page::<Block>(page_no)
            }
        } else if page_no < pending_id {
            if self.buffer.is_remote() {
                self.lockable.unlock(lock_type);
                let result = self.wait_for_sealed(page_no);
                self.lockable.lock(lock_type);
                result
            } else {
                let hdl = self.buffer.get_page::<Block>(page_no)?;
                if hdl.is_pending() {
                    return Err(Error::Staleness(format!(
                        "block {} of shard {} loaded as pending",
                        block, self.identifier
                    )));
                }
                Ok(hdl)
            }
        } else {
            log::warn!("shard {}: request for block {} ahead of pending", self.identifier, block);
            self.buffer.get_page::<Block>(page_no)
        }
    }

    fn wait_for_pending_entries(&self, page_no: PageNo) -> CResult<PageHandle<Block>> {
        loop {
            let hdl = self.buffer.get_page::<Block>(page_no)?;
            let expected = self.state.lock().unwrap().num_pending_events;
            if hdl.num_entries() >= expected {
                return Ok(hdl);
            }
            drop(hdl);
            self.buffer.reload::<Block>(page_no)?;
        }
    }

    fn wait_for_sealed(&self, page_no: PageNo) -> CResult<PageHandle<Block>> {
        loop {
            let hdl = self.buffer.get_page::<Block>(page_no)?;
            if !hdl.is_pending() {
                return Ok(hdl);
            }
            drop(hdl);
            self.buffer.reload::<Block>(page_no)?;
        }
    }

    /// Fetch the pending block. The pending id can rotate while the lock is
    /// dropped inside `get_block`, so re-check and retry.
    pub fn get_pending_block(&self, lock_type: LockType) -> CResult<PageHandle<Block>> {
        loop {
            let pid = self.pending_block_id();
            let block = self.get_block(pid, lock_type)?;
            if pid == self.pending_block_id() {
                return Ok(block);
            }
        }
    }

    /// Allocate a fresh pending block and publish its id.
    /// Must be called under the shard write lock (or before the shard is
    /// shared).
    pub fn generate_block(&self) -> CResult<PageHandle<Block>> {
        let hdl = self.buffer.new_page(Block::new)?;
        let mut state = self.state.lock().unwrap();
        state.pending_block_id = hdl.page_no();
        state.num_pending_events = 0;
        Ok(hdl)
    }

    /// Replica side: adopt a pending block id pushed by the upstream.
    pub fn set_pending_block(&self, id: PageNo, num_events: BlockIndex) {
        let mut state = self.state.lock().unwrap();
        state.pending_block_id = id;
        state.num_pending_events = num_events;
    }

    /// Replica side: drop a cached block after an upstream invalidation.
    pub fn discard_cached_block(&self, page_no: PageNo) {
        self.buffer.discard_cache(page_no);
    }

    /// Drop and re-read the pending block, e.g. after reconnecting.
    pub fn reload_pending_block(&self) -> CResult<()> {
        let page_no = self.pending_block_id();
        self.buffer.reload::<Block>(page_no)
    }
}
