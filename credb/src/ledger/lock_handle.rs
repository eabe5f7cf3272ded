//! Tracks the shard locks held by one operation.
//!
//! A lock handle reference-counts read and write acquisitions per shard,
//! so nested code paths (an iterator inside a policy evaluation inside an
//! operation) can re-acquire without touching the underlying lock. When a
//! parent handle is given, every acquisition is delegated to it, which
//! lets a whole transaction own the locks its operations take.
//!
//! Dropping the handle releases everything it still holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::page::PageHandle;
use crate::sync::LockType;
use crate::types::{BlockId, ShardId, INVALID_BLOCK};

use super::block::Block;
use super::Ledger;

#[derive(Default, Clone, Copy)]
struct LockInfo {
    read_count: u16,
    write_count: u16,
}

impl LockInfo {
    fn lock_type(&self) -> LockType {
        if self.write_count > 0 {
            LockType::Write
        } else {
            LockType::Read
        }
    }

    fn is_free(&self) -> bool {
        self.read_count == 0 && self.write_count == 0
    }
}

pub struct LockHandle<'a> {
    ledger: Arc<Ledger>,
    parent: Option<&'a LockHandle<'a>>,
    locks: Mutex<HashMap<ShardId, LockInfo>>,
    nonblocking: bool,
}

impl<'a> LockHandle<'a> {
    pub fn new(ledger: Arc<Ledger>) -> LockHandle<'static> {
        LockHandle { ledger, parent: None, locks: Mutex::new(HashMap::new()), nonblocking: false }
    }

    /// A handle that acquires all locks through `parent`.
    pub fn with_parent(ledger: Arc<Ledger>, parent: &'a LockHandle<'a>) -> Self {
        Self { ledger, parent: Some(parent), locks: Mutex::new(HashMap::new()), nonblocking: false }
    }

    /// A handle whose acquisitions fail with `LockContention` instead of
    /// waiting. Used during distributed prepare, where blocking could
    /// deadlock across peers.
    pub fn nonblocking(ledger: Arc<Ledger>) -> LockHandle<'static> {
        LockHandle { ledger, parent: None, locks: Mutex::new(HashMap::new()), nonblocking: true }
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn num_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Acquire (or re-acquire) a shard lock.
    pub fn acquire(&self, shard_no: ShardId, lock_type: LockType) -> CResult<()> {
        let mut locks = self.locks.lock().unwrap();
        let info = locks.get(&shard_no).copied().unwrap_or_default();

        if let Some(parent) = self.parent {
            parent.acquire(shard_no, lock_type)?;
        } else if info.is_free() {
            let lockable = self.ledger.shard(shard_no).lockable();
            let acquired = if self.nonblocking {
                lockable.try_lock(lock_type)
            } else {
                lockable.lock(lock_type);
                true
            };

            if !acquired {
                return Err(Error::LockContention);
            }
        } else if lock_type == LockType::Write && info.write_count == 0 {
            // Upgrade a read-held shard to write.
            let lockable = self.ledger.shard(shard_no).lockable();
            let upgraded = if self.nonblocking {
                lockable.try_read_to_write_lock()
            } else {
                lockable.read_to_write_lock();
                true
            };

            if !upgraded {
                return Err(Error::LockContention);
            }
        }

        let entry = locks.entry(shard_no).or_default();
        match lock_type {
            LockType::Read => entry.read_count += 1,
            LockType::Write => entry.write_count += 1,
        }
        Ok(())
    }

    /// Release one acquisition of a shard lock.
    pub fn release(&self, shard_no: ShardId, lock_type: LockType) {
        let mut locks = self.locks.lock().unwrap();
        let info = {
            let entry = match locks.get_mut(&shard_no) {
                Some(entry) => entry,
                None => {
                    log::error!("release of shard {} which is not held", shard_no);
                    return;
                }
            };

            match lock_type {
                LockType::Read => {
                    assert!(entry.read_count > 0, "read release without read acquisition");
                    entry.read_count -= 1;
                }
                LockType::Write => {
                    assert!(entry.write_count > 0, "write release without write acquisition");
                    entry.write_count -= 1;
                }
            }
            *entry
        };

        if let Some(parent) = self.parent {
            parent.release(shard_no, lock_type);
            if info.is_free() {
                locks.remove(&shard_no);
            }
            return;
        }

        let lockable = self.ledger.shard(shard_no).lockable();
        if info.is_free() {
            lockable.unlock(lock_type);
            locks.remove(&shard_no);
        } else if lock_type == LockType::Write && info.write_count == 0 {
            // Last writer gone but readers remain: downgrade.
            lockable.write_to_read_lock();
        }
    }

    /// Acquire the shard lock and fetch one of its blocks.
    pub fn get_block(&self, shard_no: ShardId, block: BlockId, lock_type: LockType) -> CResult<PageHandle<Block>> {
        self.acquire(shard_no, lock_type)?;
        match self.ledger.shard(shard_no).get_block(block, lock_type) {
            Ok(hdl) => Ok(hdl),
            Err(err) => {
                self.release(shard_no, lock_type);
                Err(err)
            }
        }
    }

    /// Acquire the shard lock and fetch its pending block.
    pub fn get_pending_block(&self, shard_no: ShardId, lock_type: LockType) -> CResult<PageHandle<Block>> {
        self.acquire(shard_no, lock_type)?;
        match self.ledger.shard(shard_no).get_pending_block(lock_type) {
            Ok(hdl) => Ok(hdl),
            Err(err) => {
                self.release(shard_no, lock_type);
                Err(err)
            }
        }
    }

    /// Release the acquisition taken by `get_block`. A no-op for the
    /// invalid block, so iterators can release unconditionally.
    pub fn release_block(&self, shard_no: ShardId, block: BlockId, lock_type: LockType) {
        if block == INVALID_BLOCK {
            return;
        }
        self.release(shard_no, lock_type);
    }

    /// Release every lock still held by this handle.
    pub fn clear(&self) {
        let mut locks = self.locks.lock().unwrap();

        for (shard_no, info) in locks.drain() {
            if let Some(parent) = self.parent {
                for _ in 0..info.read_count {
                    parent.release(shard_no, LockType::Read);
                }
                for _ in 0..info.write_count {
                    parent.release(shard_no, LockType::Write);
                }
            } else if !info.is_free() {
                self.ledger.shard(shard_no).lockable().unlock(info.lock_type());
            }
        }
    }
}

impl<'a> Drop for LockHandle<'a> {
    fn drop(&mut self) {
        self.clear();
    }
}
