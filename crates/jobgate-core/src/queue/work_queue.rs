//! In-memory work queue.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("work queue is full (capacity {capacity})")]
pub struct QueueFull {
    pub capacity: usize,
}

struct QueueState {
    /// Ready queue (TaskIds only).
    ready: VecDeque<TaskId>,

    /// Slots promised to submitters that have not pushed yet.
    reserved: usize,
}

/// Bounded queue shared by the scheduler (producer) and the worker pool.
///
/// # 学習ポイント
/// - 容量の確保（`try_reserve`）と投入（`QueuePermit::push`）を分ける。
///   確保に失敗したら registry に行を作らないので、飽和時に孤児行が残らない
/// - `Notify` の通知は lock の外で行う
/// - `requeue` は reaper 専用。既に受け付け済みの task なので容量を無視する
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::with_capacity(capacity),
                reserved: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids currently waiting to be popped.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve one slot without blocking.
    pub fn try_reserve(&self) -> Result<QueuePermit<'_>, QueueFull> {
        let mut state = self.lock();
        if state.ready.len() + state.reserved >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(QueuePermit {
            queue: self,
            used: false,
        })
    }

    /// Put a reclaimed task back at the tail, ignoring the capacity bound.
    pub fn requeue(&self, task_id: TaskId) {
        self.lock().ready.push_back(task_id);
        debug!(task_id = %task_id, "task requeued");
        self.notify.notify_one();
    }

    /// Drop a still-queued id. Returns false if a worker already popped it.
    pub fn remove(&self, task_id: TaskId) -> bool {
        let mut state = self.lock();
        let before = state.ready.len();
        state.ready.retain(|id| *id != task_id);
        state.ready.len() != before
    }

    /// Wait for the next id (FIFO). Cancel-safe: nothing is removed until
    /// the future resolves.
    pub async fn pop(&self) -> TaskId {
        loop {
            if let Some(task_id) = self.lock().ready.pop_front() {
                return task_id;
            }
            self.notify.notified().await;
        }
    }

    /// Non-waiting variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<TaskId> {
        self.lock().ready.pop_front()
    }
}

/// A reserved queue slot. Dropping it unused gives the slot back.
#[must_use = "a permit holds a queue slot until it is pushed or dropped"]
pub struct QueuePermit<'a> {
    queue: &'a WorkQueue,
    used: bool,
}

impl QueuePermit<'_> {
    pub fn push(mut self, task_id: TaskId) {
        {
            let mut state = self.queue.lock();
            state.reserved -= 1;
            state.ready.push_back(task_id);
        }
        self.used = true;
        // Notify outside the lock
        self.queue.notify.notify_one();
    }
}

impl Drop for QueuePermit<'_> {
    fn drop(&mut self) {
        if !self.used {
            self.queue.lock().reserved -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use ulid::Ulid;

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[test]
    fn reserve_fails_fast_when_full() {
        let queue = WorkQueue::new(2);
        queue.try_reserve().unwrap().push(task());
        let held = queue.try_reserve().unwrap();

        assert_eq!(queue.try_reserve().err(), Some(QueueFull { capacity: 2 }));

        drop(held);
        assert!(queue.try_reserve().is_ok());
    }

    #[test]
    fn requeue_ignores_capacity() {
        let queue = WorkQueue::new(1);
        queue.try_reserve().unwrap().push(task());
        queue.requeue(task());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn fifo_order_and_remove() {
        let queue = WorkQueue::new(8);
        let (a, b, c) = (task(), task(), task());
        for id in [a, b, c] {
            queue.try_reserve().unwrap().push(id);
        }

        assert!(queue.remove(b));
        assert!(!queue.remove(b));
        assert_eq!(queue.try_pop(), Some(a));
        assert_eq!(queue.try_pop(), Some(c));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new(4));
        let id = task();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_reserve().unwrap().push(id);

        let popped = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, id);
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let queue = WorkQueue::new(4);
        let result = tokio::time::timeout(Duration::from_millis(20), queue.pop()).await;
        assert!(result.is_err());
    }
}
