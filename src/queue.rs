//! Thread-safe FIFO for handing work from application threads to the
//! event-loop thread.
//!
//! One mutex on the critical path, a condvar signalled by whichever thread
//! pushes. Push order is preserved per producer; allocation failure is a
//! return value, never a panic.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("queue allocation failed")]
    Alloc,
}

pub struct Queue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Appends an item and wakes one waiter.
    pub fn push(&self, item: T) -> Result<(), PushError> {
        let mut q = self.inner.lock().expect("queue mutex poisoned");
        if q.len() == q.capacity() {
            q.try_reserve(1).map_err(|_| PushError::Alloc)?;
        }
        q.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Takes the head without blocking.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().expect("queue mutex poisoned").pop_front()
    }

    /// Blocks until the queue is non-empty, then takes the head.
    pub fn pop_wait(&self) -> T {
        let mut q = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = q.pop_front() {
                return item;
            }
            q = self.cond.wait(q).expect("queue mutex poisoned");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
