//! Deduplicating work queue with delayed adds.
//!
//! A key is pending at most once across the immediate and delayed tiers, and
//! is never handed to two workers at the same time: a key re-added while in
//! flight is redelivered only after [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

struct State<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be processed (queued, or re-added while in flight).
    dirty: HashSet<T>,
    processing: HashSet<T>,
    /// Delayed keys and when they become ready.
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Mark `item` as needing processing now.
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        state.waiting.remove(&item);
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if !state.processing.contains(&item) {
            state.queue.push_back(item);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed. The earliest pending deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            match state.waiting.get(&item) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.waiting.insert(item.clone(), deadline);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let ready = {
                let mut state = queue.inner.state.lock();
                // Superseded by an earlier deadline, an immediate add, or shutdown.
                if state.waiting.get(&item) == Some(&deadline) {
                    state.waiting.remove(&item);
                    true
                } else {
                    false
                }
            };
            if ready {
                queue.add(item);
            }
        });
    }

    /// Wait for the next item. `None` means the queue is shutting down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Finish processing `item`, releasing it for redelivery if it was re-added.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out items and drop everything delayed.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Items ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items waiting on a delay.
    pub fn delayed_len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }
}
