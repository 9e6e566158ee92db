//! Thread-safe delay queue: each entry carries a reveal time and becomes
//! visible to `pop` only once that time has been reached.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry<T> {
    reveal: Instant,
    seq: u64,
    value: T,
}

// Min-heap ordering over (reveal, seq); insertion order breaks ties.
impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.reveal == other.reveal && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.reveal, other.seq).cmp(&(self.reveal, self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// Time-ordered queue. Cheap to clone; clones share the same queue.
pub struct DelayQueue<T> {
    state: Arc<Mutex<State<T>>>,
    notify: Arc<Notify>,
}

impl<T> Clone for DelayQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<T: Send> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Inserts `value` with reveal time `now + delay`. Wakes a blocked
    /// `pop` iff the entry becomes the new earliest reveal.
    pub fn push(&self, value: T, delay: Duration) {
        let reveal = Instant::now() + delay;
        let new_earliest = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            let earlier = state
                .heap
                .peek()
                .map_or(true, |head| (reveal, seq) < (head.reveal, head.seq));
            state.heap.push(Entry { reveal, seq, value });
            earlier
        };
        if new_earliest {
            self.notify.notify_one();
        }
    }

    /// Removes and returns the earliest entry whose reveal time has been
    /// reached, blocking until one exists.
    pub async fn pop(&self) -> T {
        loop {
            // Register interest before inspecting the heap so a concurrent
            // push between the check and the await is not lost.
            let notified = self.notify.notified();
            let deadline = {
                let mut state = self.state.lock().unwrap();
                match state.heap.peek() {
                    Some(head) if head.reveal <= Instant::now() => {
                        let entry = state.heap.pop().unwrap();
                        let more_ready = state
                            .heap
                            .peek()
                            .is_some_and(|next| next.reveal <= Instant::now());
                        drop(state);
                        if more_ready {
                            self.notify.notify_one();
                        }
                        return entry.value;
                    }
                    Some(head) => Some(head.reveal),
                    None => None,
                }
            };
            match deadline {
                Some(reveal) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(reveal) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pops_in_reveal_order_not_push_order() {
        let queue = DelayQueue::new();
        queue.push('a', Duration::from_millis(300));
        queue.push('b', Duration::from_millis(100));
        queue.push('c', Duration::from_millis(200));

        assert_eq!(queue.pop().await, 'b');
        assert_eq!(queue.pop().await, 'c');
        assert_eq!(queue.pop().await, 'a');
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn equal_reveals_pop_in_insertion_order() {
        let queue = DelayQueue::new();
        for n in 0..8 {
            queue.push(n, Duration::from_millis(50));
        }
        for n in 0..8 {
            assert_eq!(queue.pop().await, n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reveal_times_are_monotonic() {
        let queue = DelayQueue::new();
        queue.push(30u64, Duration::from_millis(30));
        queue.push(10u64, Duration::from_millis(10));
        queue.push(20u64, Duration::from_millis(20));

        let mut last = 0;
        for _ in 0..3 {
            let v = queue.pop().await;
            assert!(v >= last);
            last = v;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_wakes_blocked_pop() {
        let queue = DelayQueue::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.push("late", Duration::from_millis(500));
        // An earlier entry must preempt the pending 500 ms deadline.
        queue.push("early", Duration::from_millis(50));

        assert_eq!(popper.await.unwrap(), "early");
        assert_eq!(queue.pop().await, "late");
    }

    #[tokio::test]
    async fn zero_delay_is_immediately_available() {
        let queue = DelayQueue::new();
        queue.push(1, Duration::ZERO);
        assert_eq!(queue.pop().await, 1);
    }

    #[tokio::test]
    async fn clear_empties_the_queue() {
        let queue = DelayQueue::new();
        queue.push(1, Duration::from_secs(10));
        queue.push(2, Duration::from_secs(20));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }
}
