//! Bounded latest-wins queue feeding the live publish workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};

pub const DEFAULT_LIVE_BUFFER_CAPACITY: usize = 2000;

/// FIFO queue with a fixed capacity and a reject-oldest overflow policy.
///
/// `push` never waits: when the queue is full the oldest pending item is
/// evicted and handed back to the caller, so the freshest items always win.
/// Consumers wait in [`LatestWinsBuffer::pop`] until an item arrives or the
/// buffer is closed.
#[derive(Debug)]
pub struct LatestWinsBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Notify,
    closed: AtomicBool,
    evicted: AtomicU64,
}

impl<T> LatestWinsBuffer<T> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
            closed: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `item`, returning the evicted oldest item if the buffer was full.
    /// Items pushed after [`close`](Self::close) are handed straight back.
    pub async fn push(&self, item: T) -> Option<T> {
        if self.is_closed() {
            return Some(item);
        }

        let evicted = {
            let mut items = self.items.lock().await;
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };

        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        evicted
    }

    /// Next pending item, oldest first. `None` once closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
                if self.is_closed() {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub async fn try_pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    /// Wakes every waiting consumer; pending items can still be popped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Items dropped by the overflow policy since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
