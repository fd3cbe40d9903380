//! Admission control: a fixed-size semaphore in front of a bounded queue.
//!
//! A task runs immediately only when a permit is free and nobody is waiting.
//! Otherwise it waits in the queue (priority first, then arrival order) or is
//! rejected once the queue is full. A finishing task hands its permit directly
//! to the head of the queue, so newcomers never overtake waiting tasks.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::task::TaskPriority;

#[derive(Debug)]
struct Waiting<T> {
    item: T,
    priority: TaskPriority,
    enqueued_at: Instant,
}

#[derive(Debug)]
pub(crate) enum Admit<T> {
    Run(T, OwnedSemaphorePermit),
    Queued,
    Full(T),
}

/// What a released permit turned into.
#[derive(Debug)]
pub(crate) struct Handoff<T> {
    pub next: Option<(T, OwnedSemaphorePermit)>,
    /// Waited past the queue timeout; must fail without running
    pub expired: Vec<T>,
}

#[derive(Debug)]
pub(crate) struct Admission<T> {
    semaphore: Arc<Semaphore>,
    limit: usize,
    capacity: usize,
    wait_timeout: Duration,
    queue: Mutex<VecDeque<Waiting<T>>>,
    /// Signalled whenever a slot frees up
    freed: Notify,
}

impl<T> Admission<T> {
    pub(crate) fn new(limit: usize, capacity: usize, wait_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            capacity,
            wait_timeout,
            queue: Mutex::new(VecDeque::new()),
            freed: Notify::new(),
        }
    }

    pub(crate) fn admit(&self, item: T, priority: TaskPriority) -> Admit<T> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                return Admit::Run(item, permit);
            }
        }
        if queue.len() >= self.capacity {
            return Admit::Full(item);
        }
        let at = queue
            .iter()
            .position(|w| w.priority < priority)
            .unwrap_or(queue.len());
        queue.insert(
            at,
            Waiting {
                item,
                priority,
                enqueued_at: Instant::now(),
            },
        );
        Admit::Queued
    }

    /// Give `permit` to the next waiting task, or return it to the semaphore.
    pub(crate) fn release(&self, permit: OwnedSemaphorePermit) -> Handoff<T> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut queue = self.queue.lock();
        let next = loop {
            match queue.pop_front() {
                Some(w) if now.duration_since(w.enqueued_at) >= self.wait_timeout => expired.push(w.item),
                Some(w) => break Some((w.item, permit)),
                None => {
                    // dropped under the lock so `admit` cannot miss it
                    drop(permit);
                    break None;
                }
            }
        };
        drop(queue);
        self.freed.notify_waiters();
        Handoff { next, expired }
    }

    /// Remove every task that waited past the queue timeout.
    pub(crate) fn take_expired(&self) -> Vec<T> {
        let now = Instant::now();
        let mut queue = self.queue.lock();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for w in queue.drain(..) {
            if now.duration_since(w.enqueued_at) >= self.wait_timeout {
                expired.push(w.item);
            } else {
                kept.push_back(w);
            }
        }
        *queue = kept;
        drop(queue);
        if !expired.is_empty() {
            self.freed.notify_waiters();
        }
        expired
    }

    /// Remove the first waiting task matching `pred`.
    pub(crate) fn remove(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut queue = self.queue.lock();
        let at = queue.iter().position(|w| pred(&w.item))?;
        let removed = queue.remove(at).map(|w| w.item);
        drop(queue);
        self.freed.notify_waiters();
        removed
    }

    pub(crate) fn drain_queue(&self) -> Vec<T> {
        let drained: Vec<T> = self.queue.lock().drain(..).map(|w| w.item).collect();
        self.freed.notify_waiters();
        drained
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Whether one more task would be accepted right now.
    pub(crate) fn has_capacity(&self) -> bool {
        let queue = self.queue.lock();
        (queue.is_empty() && self.semaphore.available_permits() > 0) || queue.len() < self.capacity
    }

    /// Resolves once a slot may have become free.
    pub(crate) async fn wait_for_capacity(&self) {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.has_capacity() {
                return;
            }
            freed.await;
        }
    }

    /// Interval of the background sweep for expired queue entries.
    pub(crate) fn sweep_interval(&self) -> Duration {
        (self.wait_timeout / 4).max(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(limit: usize, capacity: usize) -> Admission<u32> {
        Admission::new(limit, capacity, Duration::from_secs(30))
    }

    #[test]
    fn test_two_run_one_queues_fourth_is_full() {
        let adm = admission(2, 1);
        let mut permits = Vec::new();
        for n in 0..2 {
            match adm.admit(n, TaskPriority::Medium) {
                Admit::Run(_, permit) => permits.push(permit),
                other => panic!("expected run, got {other:?}"),
            }
        }
        assert!(matches!(adm.admit(2, TaskPriority::Medium), Admit::Queued));
        assert!(matches!(adm.admit(3, TaskPriority::Medium), Admit::Full(3)));
        assert_eq!(adm.in_flight(), 2);
        assert_eq!(adm.queue_depth(), 1);
        assert!(!adm.has_capacity());

        let handoff = adm.release(permits.pop().unwrap());
        let (next, _permit) = handoff.next.expect("queued task takes the permit");
        assert_eq!(next, 2);
        assert_eq!(adm.in_flight(), 2);
    }

    #[test]
    fn test_priority_then_fifo() {
        let adm = admission(1, 8);
        let Admit::Run(_, mut permit) = adm.admit(0, TaskPriority::Low) else {
            panic!("first task runs");
        };
        for (n, p) in [(1, TaskPriority::Low), (2, TaskPriority::High), (3, TaskPriority::Low), (4, TaskPriority::High)] {
            assert!(matches!(adm.admit(n, p), Admit::Queued));
        }
        let mut order = Vec::new();
        loop {
            let handoff = adm.release(permit);
            match handoff.next {
                Some((n, next)) => {
                    order.push(n);
                    permit = next;
                }
                None => break,
            }
        }
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert_eq!(adm.in_flight(), 0);
    }

    #[test]
    fn test_newcomer_does_not_barge_past_queue() {
        let adm = admission(1, 4);
        let Admit::Run(_, permit) = adm.admit(0, TaskPriority::Medium) else {
            panic!("first task runs");
        };
        assert!(matches!(adm.admit(1, TaskPriority::Medium), Admit::Queued));
        let handoff = adm.release(permit);
        assert_eq!(handoff.next.as_ref().map(|(n, _)| *n), Some(1));
        // the permit went to task 1, so a newcomer has to queue
        assert!(matches!(adm.admit(2, TaskPriority::Critical), Admit::Queued));
    }

    #[test]
    fn test_zero_capacity_rejects_when_saturated() {
        let adm = admission(1, 0);
        let _running = adm.admit(0, TaskPriority::Medium);
        assert!(matches!(adm.admit(1, TaskPriority::Medium), Admit::Full(1)));
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_handed_a_permit() {
        let adm = Admission::new(1, 4, Duration::from_millis(20));
        let Admit::Run(_, permit) = adm.admit(0u32, TaskPriority::Medium) else {
            panic!("first task runs");
        };
        assert!(matches!(adm.admit(1, TaskPriority::Medium), Admit::Queued));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(adm.admit(2, TaskPriority::Medium), Admit::Queued));

        let handoff = adm.release(permit);
        assert_eq!(handoff.expired, vec![1]);
        assert_eq!(handoff.next.map(|(n, _)| n), Some(2));
    }

    #[test]
    fn test_remove_waiting_task() {
        let adm = admission(1, 4);
        let _running = adm.admit(0, TaskPriority::Medium);
        adm.admit(1, TaskPriority::Medium);
        adm.admit(2, TaskPriority::Medium);
        assert_eq!(adm.remove(|n| *n == 2), Some(2));
        assert_eq!(adm.remove(|n| *n == 9), None);
        assert_eq!(adm.drain_queue(), vec![1]);
    }
}
