//! Virtual-time event scheduling
//!
//! Every protocol component in this crate is driven by events scheduled
//! against a virtual clock. Components never block: they ask a [`Scheduler`]
//! to hand an event back at a later instant and react when it fires.
//!
//! ## Ordering
//!
//! Events due at the same instant fire in the order they were scheduled.
//! Cancelled events never fire, so re-arming a timer (cancel, then schedule)
//! can never double-fire.
//!
//! ## Example
//!
//! ```rust
//! use flee_core::scheduler::{EventQueue, Scheduler};
//! use std::time::Duration;
//!
//! let mut queue = EventQueue::new();
//! let late = queue.schedule_after(Duration::from_millis(10), "late");
//! queue.schedule_now("now");
//! queue.cancel(late);
//!
//! assert_eq!(queue.pop(), Some((Duration::ZERO, "now")));
//! assert_eq!(queue.pop(), None);
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle to a scheduled event, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Scheduler collaborator used by the MAC and routing layers
///
/// `E` is the event type handed back when the timer fires. The owner of the
/// component dispatches it to the component's `handle_event`.
pub trait Scheduler<E> {
    /// Current virtual time since the start of the run
    fn now(&self) -> Duration;

    /// Schedule `event` to fire after `delay`
    fn schedule_after(&mut self, delay: Duration, event: E) -> TimerHandle;

    /// Schedule `event` at the current instant, after everything already
    /// due at this instant
    fn schedule_now(&mut self, event: E) -> TimerHandle {
        self.schedule_after(Duration::ZERO, event)
    }

    /// Cancel a pending event. Returns `false` if it already fired or was
    /// already cancelled.
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

/// An event waiting in the queue
#[derive(Debug)]
struct Scheduled<E> {
    at: Duration,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest time, then earliest seq)
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Discrete-event queue implementing [`Scheduler`]
#[derive(Debug)]
pub struct EventQueue<E> {
    now: Duration,
    next_seq: u64,
    heap: BinaryHeap<Scheduled<E>>,
    /// Sequence numbers that are scheduled and not cancelled
    live: HashSet<u64>,
}

impl<E> EventQueue<E> {
    /// Create an empty queue at time zero
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            heap: BinaryHeap::new(),
            live: HashSet::new(),
        }
    }

    /// Remove the next live event and advance the clock to its time
    pub fn pop(&mut self) -> Option<(Duration, E)> {
        while let Some(item) = self.heap.pop() {
            if self.live.remove(&item.seq) {
                self.now = item.at;
                return Some((item.at, item.event));
            }
        }
        None
    }

    /// Time of the next live event, without removing it
    pub fn peek_time(&mut self) -> Option<Duration> {
        while let Some(item) = self.heap.peek() {
            if self.live.contains(&item.seq) {
                return Some(item.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Move the clock forward without firing anything
    ///
    /// Never moves the clock backwards.
    pub fn advance_to(&mut self, time: Duration) {
        if time > self.now {
            self.now = time;
        }
    }

    /// Whether `handle` is still waiting to fire
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Check if no live events remain
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> for EventQueue<E> {
    fn now(&self) -> Duration {
        self.now
    }

    fn schedule_after(&mut self, delay: Duration, event: E) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(Scheduled {
            at: self.now + delay,
            seq,
            event,
        });
        TimerHandle(seq)
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle.0)
    }
}

/// Adapts a scheduler of `B` events into a scheduler of `A` events
///
/// Lets a component that only knows its own event type run on a shared
/// queue, e.g. one node's routing events on a whole-network simulator queue.
pub struct MappedScheduler<'a, S, F> {
    inner: &'a mut S,
    map: F,
}

impl<'a, S, F> MappedScheduler<'a, S, F> {
    pub fn new(inner: &'a mut S, map: F) -> Self {
        Self { inner, map }
    }
}

impl<'a, A, B, S, F> Scheduler<A> for MappedScheduler<'a, S, F>
where
    S: Scheduler<B>,
    F: Fn(A) -> B,
{
    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn schedule_after(&mut self, delay: Duration, event: A) -> TimerHandle {
        let mapped = (self.map)(event);
        self.inner.schedule_after(delay, mapped)
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.inner.cancel(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_in_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule_after(Duration::from_millis(30), 3);
        queue.schedule_after(Duration::from_millis(10), 1);
        queue.schedule_after(Duration::from_millis(20), 2);

        let fired: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(_, e)| e).collect();
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(queue.now(), Duration::from_millis(30));
    }

    #[test]
    fn test_same_instant_is_fifo() {
        let mut queue = EventQueue::new();
        for i in 0..5 {
            queue.schedule_after(Duration::from_millis(7), i);
        }
        let fired: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(_, e)| e).collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_schedule_now_runs_after_already_due_events() {
        let mut queue = EventQueue::new();
        queue.schedule_now("first");
        queue.schedule_now("second");
        assert_eq!(queue.pop().map(|(_, e)| e), Some("first"));
        queue.schedule_now("third");
        assert_eq!(queue.pop().map(|(_, e)| e), Some("second"));
        assert_eq!(queue.pop().map(|(_, e)| e), Some("third"));
    }

    #[test]
    fn test_cancel() {
        let mut queue = EventQueue::new();
        let handle = queue.schedule_after(Duration::from_millis(5), "x");
        assert!(queue.is_pending(handle));
        assert_eq!(queue.len(), 1);

        assert!(queue.cancel(handle));
        assert!(!queue.cancel(handle));
        assert!(!queue.is_pending(handle));
        assert!(queue.is_empty());
        assert_eq!(queue.peek_time(), None);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut queue = EventQueue::new();
        let handle = queue.schedule_now(1);
        assert!(queue.pop().is_some());
        assert!(!queue.cancel(handle));
    }

    #[test]
    fn test_delays_are_relative_to_now() {
        let mut queue = EventQueue::new();
        queue.schedule_after(Duration::from_millis(100), "tick");
        queue.pop();
        queue.schedule_after(Duration::from_millis(50), "later");
        assert_eq!(queue.peek_time(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn test_advance_to_never_rewinds() {
        let mut queue: EventQueue<()> = EventQueue::new();
        queue.advance_to(Duration::from_secs(2));
        queue.advance_to(Duration::from_secs(1));
        assert_eq!(queue.now(), Duration::from_secs(2));
    }

    #[test]
    fn test_mapped_scheduler() {
        #[derive(Debug, PartialEq)]
        enum Outer {
            Node(usize, &'static str),
        }

        let mut queue = EventQueue::new();
        {
            let mut scoped = MappedScheduler::new(&mut queue, |e| Outer::Node(3, e));
            let handle = scoped.schedule_after(Duration::from_millis(1), "cancelled");
            scoped.schedule_now("kept");
            assert!(scoped.cancel(handle));
        }
        assert_eq!(queue.pop(), Some((Duration::ZERO, Outer::Node(3, "kept"))));
        assert_eq!(queue.pop(), None);
    }
}
