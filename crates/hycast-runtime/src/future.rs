//! Shared handle on a background task's eventual result.
//!
//! A `TaskFuture` moves `pending → {returned | threw | canceled}` exactly
//! once; terminal states are sticky. Every clone sees the same slot, so the
//! submitter, the completer queue, and the task itself can all hold one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::AbortHandle;

use hycast_core::{Error, Result};

/// Process-unique identity of a submitted task.
pub type TaskId = u64;

enum State<V> {
    Pending,
    Returned(V),
    Threw(Error),
    Canceled,
}

struct Shared<V> {
    state: Mutex<State<V>>,
    done: Notify,
    canceled: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

pub struct TaskFuture<V> {
    id: TaskId,
    shared: Arc<Shared<V>>,
}

impl<V> Clone for TaskFuture<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl<V> TaskFuture<V> {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                done: Notify::new(),
                canceled: AtomicBool::new(false),
                abort: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the future is in a terminal state.
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock().unwrap(), State::Pending)
    }

    /// Reports the sticky cancellation bit.
    pub fn was_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    /// Cancels the task: marks the future canceled and aborts the running
    /// task. Idempotent; a no-op once the future is terminal.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !matches!(*state, State::Pending) {
                return;
            }
            *state = State::Canceled;
        }
        self.shared.canceled.store(true, Ordering::Release);
        if let Some(handle) = self.shared.abort.lock().unwrap().take() {
            handle.abort();
        }
        self.shared.done.notify_waiters();
    }

    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        // cancel() may already have run; abort immediately in that case.
        if self.was_canceled() {
            handle.abort();
            return;
        }
        *self.shared.abort.lock().unwrap() = Some(handle);
    }

    /// Transition to `returned`. False if the future was already terminal.
    pub(crate) fn set_returned(&self, value: V) -> bool {
        self.settle(State::Returned(value))
    }

    /// Transition to `threw`. False if the future was already terminal.
    pub(crate) fn set_threw(&self, err: Error) -> bool {
        self.settle(State::Threw(err))
    }

    /// Force a terminal state if the task vanished without reporting one
    /// (aborted mid-flight or panicked).
    pub(crate) fn settle_canceled(&self) {
        if self.settle(State::Canceled) {
            self.shared.canceled.store(true, Ordering::Release);
        }
    }

    fn settle(&self, terminal: State<V>) -> bool {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !matches!(*state, State::Pending) {
                return false;
            }
            *state = terminal;
        }
        self.shared.abort.lock().unwrap().take();
        self.shared.done.notify_waiters();
        true
    }
}

impl<V: Clone> TaskFuture<V> {
    /// Blocks until the task is terminal, then returns its value, rethrows
    /// its error, or fails because the task was canceled.
    pub async fn result(&self) -> Result<V> {
        loop {
            // Register before checking so a completion between the check and
            // the await still wakes us.
            let notified = self.shared.done.notified();
            {
                let state = self.shared.state.lock().unwrap();
                match &*state {
                    State::Pending => {}
                    State::Returned(value) => return Ok(value.clone()),
                    State::Threw(err) => return Err(err.clone()),
                    State::Canceled => {
                        return Err(Error::Logic("no result — task canceled".into()))
                    }
                }
            }
            notified.await;
        }
    }
}

impl<V> std::fmt::Debug for TaskFuture<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.shared.state.lock().unwrap() {
            State::Pending => "pending",
            State::Returned(_) => "returned",
            State::Threw(_) => "threw",
            State::Canceled => "canceled",
        };
        f.debug_struct("TaskFuture")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returned_value_is_shared_by_clones() {
        let future = TaskFuture::new(1);
        let other = future.clone();
        assert!(future.set_returned(17));
        assert_eq!(future.result().await.unwrap(), 17);
        assert_eq!(other.result().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let future: TaskFuture<u32> = TaskFuture::new(2);
        assert!(future.set_returned(1));
        assert!(!future.set_returned(2));
        assert!(!future.set_threw(Error::Runtime("late".into())));
        future.cancel();
        assert!(!future.was_canceled());
        assert_eq!(future.result().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn canceled_result_is_a_logic_error() {
        let future: TaskFuture<()> = TaskFuture::new(3);
        future.cancel();
        assert!(future.was_canceled());
        assert!(matches!(future.result().await, Err(Error::Logic(_))));
    }

    #[tokio::test]
    async fn thrown_error_reaches_every_holder() {
        let future: TaskFuture<()> = TaskFuture::new(4);
        let other = future.clone();
        future.set_threw(Error::Runtime("boom".into()));
        assert!(matches!(other.result().await, Err(Error::Runtime(_))));
    }

    #[tokio::test]
    async fn result_blocks_until_settled() {
        let future: TaskFuture<u8> = TaskFuture::new(5);
        let waiter = {
            let future = future.clone();
            tokio::spawn(async move { future.result().await })
        };
        tokio::task::yield_now().await;
        future.set_returned(9);
        assert_eq!(waiter.await.unwrap().unwrap(), 9);
    }
}
