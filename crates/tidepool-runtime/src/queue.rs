//! [`TaskQueue`] – pending / active / completed bookkeeping for the coordinator.
//!
//! Admission is deduplicated by operation id against the pending queue, and
//! at most one task is active at a time.
//!
//! # Example
//!
//! ```rust
//! use tidepool_runtime::queue::TaskQueue;
//! use tidepool_types::{ComputeTask, EligibleOperation};
//!
//! let op = EligibleOperation {
//!     id: "op-1".into(),
//!     name: "prime_search".into(),
//!     parameters: serde_json::json!({}),
//!     task_hash: "h".into(),
//!     task_signature: None,
//!     required_compute_power: 1,
//!     unlock_threshold: 0,
//! };
//! let mut queue = TaskQueue::new();
//! assert!(queue.admit(ComputeTask::from_operation(&op)));
//! assert!(!queue.admit(ComputeTask::from_operation(&op))); // same operation id
//!
//! let task = queue.begin().unwrap();
//! queue.finish(task.id);
//! assert_eq!(queue.status().completed, 1);
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tidepool_types::ComputeTask;
use uuid::Uuid;

/// Counts reported by [`TaskQueue::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<ComputeTask>,
    active: Option<Uuid>,
    completed: Vec<Uuid>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` unless a pending task already carries its operation id.
    pub fn admit(&mut self, task: ComputeTask) -> bool {
        if self
            .pending
            .iter()
            .any(|pending| pending.operation_id == task.operation_id)
        {
            return false;
        }
        self.pending.push_back(task);
        true
    }

    /// Pop the oldest pending task and mark it active.  Returns `None` when a
    /// task is already active or nothing is pending.
    pub fn begin(&mut self) -> Option<ComputeTask> {
        if self.active.is_some() {
            return None;
        }
        let task = self.pending.pop_front()?;
        self.active = Some(task.id);
        Some(task)
    }

    /// Move `task_id` from active to completed.  Used on success and failure
    /// alike.
    pub fn finish(&mut self, task_id: Uuid) {
        if self.active == Some(task_id) {
            self.active = None;
        }
        self.completed.push(task_id);
    }

    pub fn active(&self) -> Option<Uuid> {
        self.active
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.pending.len(),
            active: usize::from(self.active.is_some()),
            completed: self.completed.len(),
        }
    }

    /// Drop pending work; the active slot and history are kept.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_types::EligibleOperation;

    fn task(op_id: &str) -> ComputeTask {
        ComputeTask::from_operation(&EligibleOperation {
            id: op_id.into(),
            name: "sha256_batch".into(),
            parameters: serde_json::json!({"inputs": []}),
            task_hash: "h".into(),
            task_signature: None,
            required_compute_power: 1,
            unlock_threshold: 0,
        })
    }

    #[test]
    fn admission_dedupes_by_operation_id() {
        let mut queue = TaskQueue::new();
        assert!(queue.admit(task("a")));
        assert!(queue.admit(task("b")));
        assert!(!queue.admit(task("a")));
        assert_eq!(queue.status().pending, 2);
    }

    #[test]
    fn operation_can_be_readmitted_once_it_left_pending() {
        let mut queue = TaskQueue::new();
        queue.admit(task("a"));
        let running = queue.begin().unwrap();
        assert!(queue.admit(task("a")));
        queue.finish(running.id);
        assert_eq!(queue.status(), QueueStatus { pending: 1, active: 0, completed: 1 });
    }

    #[test]
    fn begin_is_fifo_and_serial() {
        let mut queue = TaskQueue::new();
        queue.admit(task("first"));
        queue.admit(task("second"));

        let first = queue.begin().unwrap();
        assert_eq!(first.operation_id, "first");
        assert!(queue.begin().is_none(), "second task must wait for the first");
        assert_eq!(queue.status().active, 1);

        queue.finish(first.id);
        assert_eq!(queue.begin().unwrap().operation_id, "second");
    }

    #[test]
    fn begin_on_empty_queue_is_none() {
        let mut queue = TaskQueue::new();
        assert!(queue.begin().is_none());
        assert_eq!(queue.active(), None);
    }
}
