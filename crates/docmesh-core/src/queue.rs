//! Async queues
//!
//! [`AsyncQueue`] is a FIFO whose `next` suspends until an item is available
//! or a cancellation token fires. [`PriorityAsyncQueue`] lets a
//! [`SharedPriorityTarget`] pull matching items ahead of their turn; all the
//! queues of one engine share a single target, so changing the rule once
//! reorders every queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::document_id::DocId;

/// A dequeue was abandoned because its token was cancelled
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Queue wait cancelled")]
pub struct Cancelled;

/// FIFO queue with a suspending, cancellable `next`
pub struct AsyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append items and wake one waiting consumer
    pub fn push(&self, items: impl IntoIterator<Item = T>) {
        let mut queue = self.items.lock();
        let before = queue.len();
        queue.extend(items);
        let pushed = queue.len() > before;
        drop(queue);

        if pushed {
            self.notify.notify_one();
        }
    }

    /// Take the head item, waiting for one if the queue is empty
    pub async fn next(&self, token: &CancellationToken) -> Result<T, Cancelled> {
        self.next_with(token, |items| items.pop_front()).await
    }

    /// Take the item chosen by `select`, waiting until it chooses one
    ///
    /// `select` runs against the whole queue under the lock each time the
    /// queue is checked, so it must not block.
    pub async fn next_with<F>(&self, token: &CancellationToken, mut select: F) -> Result<T, Cancelled>
    where
        F: FnMut(&mut VecDeque<T>) -> Option<T>,
    {
        loop {
            if token.is_cancelled() {
                return Err(Cancelled);
            }

            // Register interest before checking, so a push between the check
            // and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let picked = select(&mut self.items.lock());
            if let Some(item) = picked {
                return Ok(item);
            }

            tokio::select! {
                _ = token.cancelled() => return Err(Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Drop the first item matching `predicate`
    pub fn remove<P>(&self, predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        let mut queue = self.items.lock();
        let index = queue.iter().position(predicate)?;
        queue.remove(index)
    }

    /// Mutate the first item matching `predicate` in place
    ///
    /// Returns `false` if nothing matched.
    pub fn update<P, F>(&self, mut predicate: P, f: F) -> bool
    where
        P: FnMut(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let mut queue = self.items.lock();
        match queue.iter_mut().find(|item| predicate(item)) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: Clone> AsyncQueue<T> {
    /// Peek at the first item matching `predicate`
    pub fn find<P>(&self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.items.lock().iter().find(|item| predicate(item)).cloned()
    }
}

/// Priority predicate over document ids
pub type PriorityRule = Arc<dyn Fn(&DocId) -> bool + Send + Sync>;

/// One mutable slot holding the current priority rule
///
/// Cloning shares the slot. Queues read it from different worker threads,
/// so it sits behind a lock.
#[derive(Clone, Default)]
pub struct SharedPriorityTarget {
    rule: Arc<RwLock<Option<PriorityRule>>>,
}

impl SharedPriorityTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule for every queue sharing this target
    pub fn set_rule<F>(&self, rule: F)
    where
        F: Fn(&DocId) -> bool + Send + Sync + 'static,
    {
        *self.rule.write() = Some(Arc::new(rule));
    }

    /// Go back to plain FIFO order
    pub fn clear_rule(&self) {
        *self.rule.write() = None;
    }

    /// Current rule, if any
    pub fn rule(&self) -> Option<PriorityRule> {
        self.rule.read().clone()
    }
}

impl std::fmt::Debug for SharedPriorityTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPriorityTarget")
            .field("has_rule", &self.rule.read().is_some())
            .finish()
    }
}

/// Items that can be matched against a priority rule
pub trait Prioritized {
    fn doc_id(&self) -> &DocId;
}

impl Prioritized for DocId {
    fn doc_id(&self) -> &DocId {
        self
    }
}

/// AsyncQueue whose `next` serves items matching the shared rule first
pub struct PriorityAsyncQueue<T> {
    queue: AsyncQueue<T>,
    target: SharedPriorityTarget,
}

impl<T: Prioritized> PriorityAsyncQueue<T> {
    pub fn new(target: SharedPriorityTarget) -> Self {
        Self {
            queue: AsyncQueue::new(),
            target,
        }
    }

    /// Take the first item matching the priority rule, else the head
    pub async fn next(&self, token: &CancellationToken) -> Result<T, Cancelled> {
        self.queue
            .next_with(token, |items| {
                if let Some(rule) = self.target.rule() {
                    if let Some(index) = items.iter().position(|item| rule(item.doc_id())) {
                        return items.remove(index);
                    }
                }
                items.pop_front()
            })
            .await
    }

    pub fn push(&self, items: impl IntoIterator<Item = T>) {
        self.queue.push(items)
    }

    pub fn remove<P>(&self, predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.queue.remove(predicate)
    }

    pub fn update<P, F>(&self, predicate: P, f: F) -> bool
    where
        P: FnMut(&T) -> bool,
        F: FnOnce(&mut T),
    {
        self.queue.update(predicate, f)
    }

    pub fn clear(&self) {
        self.queue.clear()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Prioritized + Clone> PriorityAsyncQueue<T> {
    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.queue.find(predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(items: &[&str]) -> Vec<DocId> {
        items.iter().map(|s| DocId::from(*s)).collect()
    }

    #[tokio::test]
    async fn test_fifo_without_rule() {
        let queue = PriorityAsyncQueue::new(SharedPriorityTarget::new());
        let token = CancellationToken::new();
        queue.push(ids(&["a", "b", "c"]));

        assert_eq!(queue.next(&token).await.unwrap(), "a");
        assert_eq!(queue.next(&token).await.unwrap(), "b");
        assert_eq!(queue.next(&token).await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_priority_rule_wins_over_arrival_order() {
        let target = SharedPriorityTarget::new();
        target.set_rule(|id| id == "b");
        let queue = PriorityAsyncQueue::new(target);
        let token = CancellationToken::new();
        queue.push(ids(&["a", "b", "c"]));

        assert_eq!(queue.next(&token).await.unwrap(), "b");
        assert_eq!(queue.next(&token).await.unwrap(), "a");
        assert_eq!(queue.next(&token).await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_rule_change_applies_to_all_sharing_queues() {
        let target = SharedPriorityTarget::new();
        let pull = PriorityAsyncQueue::new(target.clone());
        let push = PriorityAsyncQueue::new(target.clone());
        let token = CancellationToken::new();
        pull.push(ids(&["a", "z"]));
        push.push(ids(&["b", "z"]));

        target.set_rule(|id| id == "z");

        assert_eq!(pull.next(&token).await.unwrap(), "z");
        assert_eq!(push.next(&token).await.unwrap(), "z");

        target.clear_rule();
        assert!(target.rule().is_none());
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let queue = Arc::new(AsyncQueue::new());
        let token = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.next(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push([7]);
        assert_eq!(waiter.await.unwrap(), Ok(7));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let queue: Arc<AsyncQueue<u32>> = Arc::new(AsyncQueue::new());
        let token = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.next(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(Cancelled));

        // Items pushed after the cancellation stay queued
        queue.push([1]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_token() {
        let queue = AsyncQueue::new();
        queue.push([1]);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(queue.next(&token).await, Err(Cancelled));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_find_update_clear() {
        let queue = AsyncQueue::new();
        queue.push([(1, "a"), (2, "b"), (1, "c")]);

        assert_eq!(queue.find(|(k, _)| *k == 1), Some((1, "a")));
        assert_eq!(queue.remove(|(k, _)| *k == 1), Some((1, "a")));
        assert_eq!(queue.find(|(k, _)| *k == 1), Some((1, "c")));

        assert!(queue.update(|(k, _)| *k == 2, |item| item.1 = "updated"));
        assert!(!queue.update(|(k, _)| *k == 9, |_| {}));
        assert_eq!(queue.find(|(k, _)| *k == 2), Some((2, "updated")));

        queue.clear();
        assert!(queue.is_empty());
    }
}
