//! Bounded priority work queues
//!
//! Two instances carry work between the roles: the fetch queue (URLs, consumed by
//! fetchers) and the crawl queue (page bundles, consumed by crawlers). The download
//! pool uses a third instance for its transfer tasks.
//!
//! A full queue is ordinary backpressure: `push` hands the item back and the caller
//! buffers it. `pop` waits with a timeout and returns `None` on timeout, on `clear`
//! and on `close`, so no waiter can outlive a crawl.

use crate::crawler::parser::ParsedDocument;
use crate::state::Role;
use crate::url::UrlRef;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A fetched page together with the new links found on it
#[derive(Debug, Clone)]
pub struct PageBundle {
    pub source: UrlRef,
    pub children: Vec<UrlRef>,
    pub document: ParsedDocument,
}

/// What a work item carries
#[derive(Debug, Clone)]
pub enum Payload {
    /// A URL to fetch
    Url(UrlRef),
    /// A parsed page to expand
    Page(PageBundle),
}

/// A priority-tagged unit of work
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Lower values are dequeued first
    pub priority: i32,
    /// Role that produced the item
    pub role: Role,
    pub payload: Payload,
}

impl WorkItem {
    pub fn url(url: UrlRef, role: Role) -> Self {
        Self {
            priority: url.priority(),
            role,
            payload: Payload::Url(url),
        }
    }

    pub fn page(bundle: PageBundle, role: Role) -> Self {
        Self {
            priority: bundle.source.priority(),
            role,
            payload: Payload::Page(bundle),
        }
    }

    /// The URL this item is about (the source URL for page bundles)
    pub fn subject(&self) -> &UrlRef {
        match &self.payload {
            Payload::Url(url) => url,
            Payload::Page(bundle) => &bundle.source,
        }
    }
}

// Reverse comparison so lower priority values come first from the max-heap
impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority)
    }
}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for WorkItem {}

#[derive(Debug)]
struct QueueInner<T> {
    heap: BinaryHeap<T>,
    /// Bumped by `clear`; poppers that started in an older epoch give up
    epoch: u64,
    closed: bool,
}

/// Bounded, priority-ordered queue with timed pops
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Notify,
    capacity: usize,
}

impl<T: Ord> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::with_capacity(capacity.min(1024)),
                epoch: 0,
                closed: false,
            }),
            available: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an item, handing it back if the queue is full or closed
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut inner = self.lock();
            if inner.closed || inner.heap.len() >= self.capacity {
                return Err(item);
            }
            inner.heap.push(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Adds an item; returns false (dropping the item) if it was refused
    pub fn push(&self, item: T) -> bool {
        self.try_push(item).is_ok()
    }

    /// Removes the highest-priority item without waiting
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.heap.pop()
    }

    /// Removes the highest-priority item, waiting up to `timeout` for one
    pub async fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut epoch = None;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before inspecting the heap so a push in between is not missed
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                let started = *epoch.get_or_insert(inner.epoch);
                if inner.epoch != started {
                    return None;
                }
                if let Some(item) = inner.heap.pop() {
                    return Some(item);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every queued item and wakes every waiting `pop` with `None`
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.heap.clear();
            inner.epoch += 1;
        }
        self.available.notify_waiters();
    }

    /// Refuses further pushes and pops until `reopen`, waking every waiter
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Takes every queued item, highest priority first
    pub fn drain(&self) -> Vec<T> {
        let heap = std::mem::take(&mut self.lock().heap);
        heap.into_sorted_vec().into_iter().rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::CrawlUrl;
    use std::sync::Arc;

    fn item(path: &str, priority: i32) -> WorkItem {
        let url = CrawlUrl::seed(&format!("http://example.com/{}", path))
            .unwrap()
            .with_priority(priority);
        WorkItem::url(Arc::new(url), Role::Crawler)
    }

    #[tokio::test]
    async fn test_pops_lowest_priority_first() {
        let queue = WorkQueue::new(10);
        assert!(queue.push(item("c", 3)));
        assert!(queue.push(item("a", -2)));
        assert!(queue.push(item("b", 0)));

        let order: Vec<i32> = [
            queue.pop(Duration::from_millis(10)).await.unwrap(),
            queue.pop(Duration::from_millis(10)).await.unwrap(),
            queue.pop(Duration::from_millis(10)).await.unwrap(),
        ]
        .iter()
        .map(|i| i.priority)
        .collect();
        assert_eq!(order, vec![-2, 0, 3]);
    }

    #[tokio::test]
    async fn test_capacity_is_backpressure() {
        let queue = WorkQueue::new(2);
        assert!(queue.try_push(item("a", 0)).is_ok());
        assert!(queue.try_push(item("b", 0)).is_ok());

        let refused = queue.try_push(item("c", 7)).unwrap_err();
        assert_eq!(refused.priority, 7);
        assert_eq!(queue.len(), 2);
        assert!(queue.len() <= queue.capacity());
    }

    #[tokio::test]
    async fn test_pop_times_out() {
        let queue: WorkQueue<WorkItem> = WorkQueue::new(4);
        let started = std::time::Instant::now();
        assert!(queue.pop(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new(4));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(item("late", 1));

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.priority, 1);
    }

    #[tokio::test]
    async fn test_clear_wakes_every_waiter() {
        let queue: Arc<WorkQueue<WorkItem>> = Arc::new(WorkQueue::new(4));
        let poppers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop(Duration::from_secs(10)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        queue.clear();
        for popper in poppers {
            assert!(popper.await.unwrap().is_none());
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        // Still usable afterwards
        assert!(queue.push(item("again", 0)));
        assert!(queue.pop(Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn test_close_and_reopen() {
        let queue = WorkQueue::new(4);
        queue.push(item("a", 0));
        queue.close();

        assert!(queue.is_closed());
        assert!(!queue.push(item("b", 0)));
        assert!(queue.pop(Duration::from_secs(1)).await.is_none());

        queue.reopen();
        assert!(queue.pop(Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn test_drain_returns_priority_order() {
        let queue = WorkQueue::new(8);
        queue.push(item("b", 5));
        queue.push(item("a", 1));
        queue.push(item("c", 9));

        let drained: Vec<i32> = queue.drain().iter().map(|i| i.priority).collect();
        assert_eq!(drained, vec![1, 5, 9]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_producers_respect_capacity() {
        let queue = Arc::new(WorkQueue::new(16));
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut accepted = 0;
                    for i in 0..10 {
                        if queue.push(item(&format!("{}-{}", p, i), i)) {
                            accepted += 1;
                        }
                        assert!(queue.len() <= 16);
                    }
                    accepted
                })
            })
            .collect();

        let mut total = 0;
        for producer in producers {
            total += producer.await.unwrap();
        }
        assert_eq!(total, 16);
        assert_eq!(queue.len(), 16);
    }
}
