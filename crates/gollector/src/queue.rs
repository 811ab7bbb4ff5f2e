// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO handoff between pipeline stages.
//!
//! `push` waits while the queue is full, which is how slowness downstream propagates back to
//! the listeners. A capacity of zero turns the queue into a rendezvous: `push` only returns
//! once a consumer has taken the item, so nothing is ever buffered between stages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::errors::QueueClosed;

struct State<T> {
    items: VecDeque<T>,
    pushed: u64,
    popped: u64,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    // Signalled when an item is pushed or the queue is closed.
    readable: Notify,
    // Signalled when an item is popped or the queue is closed.
    writable: Notify,
}

/// Cloning a `HandoffQueue` yields another handle to the same queue.
pub struct HandoffQueue<T> {
    capacity: usize,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> HandoffQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.max(1)),
                    pushed: 0,
                    popped: 0,
                    closed: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The state is a plain buffer plus counters, always left consistent.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of items that may sit in the queue. A rendezvous queue still holds the single
    /// item being handed over.
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    /// Declared capacity, zero for a rendezvous queue.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Appends an item, waiting for room. On a rendezvous queue, also waits until a consumer
    /// has popped it.
    ///
    /// Fails, handing the item back, once the queue is closed. An item already accepted by a
    /// rendezvous queue stays deliverable even if the queue closes while waiting.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let ticket = loop {
            let writable = self.shared.writable.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueClosed(item));
                }
                if state.items.len() < self.slots() {
                    state.items.push_back(item);
                    state.pushed += 1;
                    break state.pushed;
                }
            }
            writable.await;
        };
        self.shared.readable.notify_waiters();

        if self.capacity == 0 {
            loop {
                let writable = self.shared.writable.notified();
                {
                    let state = self.lock();
                    if state.popped >= ticket || state.closed {
                        break;
                    }
                }
                writable.await;
            }
        }
        Ok(())
    }

    /// Removes the oldest item, waiting until one is available. Returns `None` once the queue
    /// is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let readable = self.shared.readable.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    state.popped += 1;
                    drop(state);
                    self.shared.writable.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Refuses further pushes and wakes every waiter. Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = HandoffQueue::new(4);
        for i in 0..4 {
            queue.push(i).await.unwrap();
        }
        assert_eq!(queue.len(), 4);
        for i in 0..4 {
            assert_eq!(queue.pop().await, Some(i));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let queue = HandoffQueue::new(1);
        queue.push(1).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), queue.push(2)).await;
        assert!(blocked.is_err(), "push on a full queue must wait");

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(3).await })
        };
        assert_eq!(queue.pop().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_pop_blocks_when_empty() {
        let queue: HandoffQueue<u32> = HandoffQueue::new(2);
        let blocked = timeout(Duration::from_millis(50), queue.pop()).await;
        assert!(blocked.is_err(), "pop on an empty queue must wait");

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        sleep(Duration::from_millis(10)).await;
        queue.push(7).await.unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_rendezvous_push_waits_for_consumer() {
        let queue = HandoffQueue::new(0);
        assert_eq!(queue.capacity(), 0);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push("hello").await })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(
            !producer.is_finished(),
            "rendezvous push must not return before the item is taken"
        );

        assert_eq!(queue.pop().await, Some("hello"));
        timeout(Duration::from_secs(1), producer)
            .await
            .expect("push should complete after pop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rendezvous_preserves_order_across_producers_sequence() {
        let queue = HandoffQueue::new(0);
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.push(i).await.unwrap();
                }
            })
        };
        for i in 0..100 {
            assert_eq!(queue.pop().await, Some(i));
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = HandoffQueue::new(3);
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.push(3).await, Err(QueueClosed(3)));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let queue: HandoffQueue<u8> = HandoffQueue::new(0);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        sleep(Duration::from_millis(10)).await;
        queue.close();
        let popped = timeout(Duration::from_secs(1), consumer).await.unwrap();
        assert_eq!(popped.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_producers_one_consumer() {
        let queue = HandoffQueue::new(0);
        let mut producers = Vec::new();
        for p in 0..8u32 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50u32 {
                    queue.push((p, i)).await.unwrap();
                }
            }));
        }

        let mut last_seen = [None::<u32>; 8];
        for _ in 0..(8 * 50) {
            let (p, i) = queue.pop().await.unwrap();
            if let Some(prev) = last_seen[p as usize] {
                assert!(i > prev, "items from one producer must stay in order");
            }
            last_seen[p as usize] = Some(i);
        }
        for producer in producers {
            producer.await.unwrap();
        }
        assert!(queue.is_empty());
    }
}
