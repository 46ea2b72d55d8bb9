//! Storage tasks and their queues
//!
//! A task is the unit of work handed to the storage worker. The blocked
//! client holds the receiving half of a oneshot channel; whichever thread
//! completes the task (worker or backend callback) resolves it exactly once,
//! which is the NONE -> OK / NONE -> ERR transition. The result is only read
//! after the channel resolves, so the channel provides the happens-before
//! edge between completion and the resumed client.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::stats::{kv_to_rcu, kv_to_wcu};

/// Completion payload of a GET: the fetched value or the backend message
pub type GetResult = Result<Bytes, String>;
/// Completion payload of a SET
pub type PutResult = Result<(), String>;

/// A GET that missed and was routed to the backing store. The issuing
/// client keeps the matching inflight generation handle; the task only
/// carries what the worker needs.
pub struct GetTask {
    pub key: Bytes,
    pub done: oneshot::Sender<GetResult>,
}

impl GetTask {
    /// Read cost; only meaningful once the value size is known
    pub fn rcu_cost(&self, val_size: usize) -> u64 {
        kv_to_rcu(self.key.len(), val_size)
    }
}

/// A write-through PUT
pub struct SetTask {
    pub key: Bytes,
    pub value: Bytes,
    pub done: oneshot::Sender<PutResult>,
}

impl SetTask {
    pub fn wcu_cost(&self) -> u64 {
        kv_to_wcu(self.key.len(), self.value.len())
    }
}

/// The worker dispatches on this tagged type
pub enum Task {
    Get(GetTask),
    Set(SetTask),
}

/// FIFO handoff between request threads and the storage worker. The
/// critical section is a push or pop, so a briefly-spinning lock fits.
pub struct TaskQueue<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, t: T) {
        self.queue.lock().push_back(t);
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let q = TaskQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_queue_concurrent_producers() {
        use std::sync::Arc;
        let q = Arc::new(TaskQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        q.push(p * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 400);
    }
}
