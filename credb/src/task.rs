//! Suspendable tasks.
//!
//! Long-running operations park while waiting for a peer's RPC response
//! and are resumed by task id when the response message arrives. The
//! transport layers build their blocking `PeerLink::call` out of this:
//! send the request carrying the task id, `wait`, and let the response
//! dispatcher `resume` the task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{CResult, Error};
use crate::peer::PeerResponse;
use crate::types::TaskId;

pub struct Task {
    id: TaskId,
    slot: Mutex<TaskSlot>,
    cond: Condvar,
}

enum TaskSlot {
    Waiting,
    Resumed(PeerResponse),
    Failed(String),
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Park until the response arrives or the task is failed.
    pub fn wait(&self) -> CResult<PeerResponse> {
        let mut slot = self.slot.lock().unwrap();
        loop {
            match std::mem::replace(&mut *slot, TaskSlot::Waiting) {
                TaskSlot::Waiting => {
                    slot = self.cond.wait(slot).unwrap();
                }
                TaskSlot::Resumed(response) => return Ok(response),
                TaskSlot::Failed(reason) => return Err(Error::TransactionAborted(reason)),
            }
        }
    }

    fn complete(&self, result: TaskSlot) {
        let mut slot = self.slot.lock().unwrap();
        *slot = result;
        self.cond.notify_all();
    }
}

/// Hands out task ids and routes responses back to the waiting task.
pub struct TaskManager {
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    next_id: AtomicU64,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Register a fresh task about to suspend.
    pub fn register(&self) -> Arc<Task> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task =
            Arc::new(Task { id, slot: Mutex::new(TaskSlot::Waiting), cond: Condvar::new() });
        self.tasks.lock().unwrap().insert(id, task.clone());
        task
    }

    /// Resume the task waiting under `id` with a response.
    pub fn resume(&self, id: TaskId, response: PeerResponse) {
        match self.tasks.lock().unwrap().remove(&id) {
            Some(task) => task.complete(TaskSlot::Resumed(response)),
            None => log::warn!("resume for unknown task {}", id),
        }
    }

    /// Fail the task, e.g. because the peer link dropped. The waiter sees
    /// an aborted transaction.
    pub fn fail(&self, id: TaskId, reason: &str) {
        if let Some(task) = self.tasks.lock().unwrap().remove(&id) {
            task.complete(TaskSlot::Failed(reason.to_string()));
        }
    }

    /// Fail every task still waiting; used at shutdown or on link loss.
    pub fn fail_all(&self, reason: &str) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.complete(TaskSlot::Failed(reason.to_string()));
        }
    }

    pub fn num_waiting(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_wakes_the_waiter() {
        let manager = Arc::new(TaskManager::new());
        let task = manager.register();
        let id = task.id();

        let waiter = std::thread::spawn(move || task.wait());

        std::thread::sleep(std::time::Duration::from_millis(20));
        manager.resume(id, PeerResponse::Ack(true));

        assert_eq!(waiter.join().unwrap().unwrap(), PeerResponse::Ack(true));
        assert_eq!(manager.num_waiting(), 0);
    }

    #[test]
    fn failure_propagates_as_abort() {
        let manager = TaskManager::new();
        let task = manager.register();

        manager.fail(task.id(), "link dropped");
        assert!(task.wait().is_err());
    }

    #[test]
    fn fail_all_drains_everything() {
        let manager = TaskManager::new();
        let t1 = manager.register();
        let t2 = manager.register();

        manager.fail_all("shutting down");
        assert!(t1.wait().is_err());
        assert!(t2.wait().is_err());
        assert_eq!(manager.num_waiting(), 0);
    }
}
