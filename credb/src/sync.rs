//! An explicit-acquire reader/writer lock.
//!
//! Shard and index-stripe locks are held across call boundaries by lock
//! handles, so the guard-based `std::sync::RwLock` does not fit. This lock
//! exposes explicit `read_lock`/`write_unlock` style operations plus the
//! upgrade/downgrade transitions the lock handle needs.

use std::sync::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

pub struct RwLockable {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Default for RwLockable {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLockable {
    pub fn new() -> Self {
        Self { state: Mutex::new(LockState::default()), cond: Condvar::new() }
    }

    pub fn lock(&self, lock_type: LockType) {
        match lock_type {
            LockType::Read => self.read_lock(),
            LockType::Write => self.write_lock(),
        }
    }

    pub fn unlock(&self, lock_type: LockType) {
        match lock_type {
            LockType::Read => self.read_unlock(),
            LockType::Write => self.write_unlock(),
        }
    }

    pub fn try_lock(&self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Read => self.try_read_lock(),
            LockType::Write => self.try_write_lock(),
        }
    }

    pub fn read_lock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn read_unlock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.readers > 0, "read_unlock without read lock");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn write_lock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;
    }

    pub fn try_write_lock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    pub fn write_unlock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer, "write_unlock without write lock");
        state.writer = false;
        self.cond.notify_all();
    }

    /// Upgrade a held read lock to a write lock, waiting for other readers
    /// to drain.
    pub fn read_to_write_lock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.readers > 0, "upgrade without read lock");
        state.readers -= 1;
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;
    }

    /// Non-blocking upgrade. On failure the read lock is retained.
    pub fn try_read_to_write_lock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        assert!(state.readers > 0, "upgrade without read lock");
        if state.writer || state.readers > 1 {
            return false;
        }
        state.readers -= 1;
        state.writer = true;
        true
    }

    /// Downgrade a held write lock to a read lock without releasing it.
    pub fn write_to_read_lock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer, "downgrade without write lock");
        state.writer = false;
        state.readers += 1;
        self.cond.notify_all();
    }
}
