//! Executor of asynchronous tasks: submit, look up, cancel, shut down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use hycast_core::{Error, Result};

use crate::future::{TaskFuture, TaskId};

tokio::task_local! {
    static CURRENT_TASK: TaskId;
}

pub(crate) struct ExecInner<V> {
    tasks: Mutex<HashMap<TaskId, TaskFuture<V>>>,
    next_id: AtomicU64,
    down: AtomicBool,
    /// Signalled whenever a task leaves the table; `await_termination`
    /// waits on it.
    idle: Notify,
    /// Completion sink installed by a `Completer`; each task's future is
    /// pushed exactly once when it becomes terminal.
    on_done: Mutex<Option<mpsc::UnboundedSender<TaskFuture<V>>>>,
}

impl<V> ExecInner<V> {
    /// Runs when a task's wrapper is dropped — normal completion, abort, or
    /// panic alike — so the table and the completion sink see every task
    /// exactly once.
    fn finish(&self, id: TaskId) {
        let future = match self.tasks.lock().unwrap().remove(&id) {
            Some(future) => future,
            None => return,
        };
        future.settle_canceled();
        if let Some(sink) = self.on_done.lock().unwrap().as_ref() {
            let _ = sink.send(future);
        }
        self.idle.notify_waiters();
    }
}

struct FinishGuard<V> {
    inner: Arc<ExecInner<V>>,
    id: TaskId,
}

impl<V> Drop for FinishGuard<V> {
    fn drop(&mut self) {
        self.inner.finish(self.id);
    }
}

/// Submits type-returning async tasks and tracks their futures until they
/// complete. Dropping the executor cancels whatever is still running.
pub struct Executor<V> {
    inner: Arc<ExecInner<V>>,
}

impl<V: Clone + Send + 'static> Default for Executor<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> Executor<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExecInner {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                down: AtomicBool::new(false),
                idle: Notify::new(),
                on_done: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_completion_sink(&self, sink: mpsc::UnboundedSender<TaskFuture<V>>) {
        *self.inner.on_done.lock().unwrap() = Some(sink);
    }

    /// Submits a task for execution and returns its future.
    pub fn submit<F>(&self, task: F) -> Result<TaskFuture<V>>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        if self.inner.down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let future = TaskFuture::new(id);
        self.inner
            .tasks
            .lock()
            .unwrap()
            .insert(id, future.clone());

        let wrapper = {
            let future = future.clone();
            let guard = FinishGuard {
                inner: self.inner.clone(),
                id,
            };
            async move {
                let _guard = guard;
                match task.await {
                    Ok(value) => future.set_returned(value),
                    Err(err) => future.set_threw(err),
                };
            }
        };
        let join = tokio::spawn(CURRENT_TASK.scope(id, wrapper));
        future.set_abort_handle(join.abort_handle());
        Ok(future)
    }

    /// The future of the task this call runs inside of.
    pub fn current_future(&self) -> Result<TaskFuture<V>> {
        let id = CURRENT_TASK
            .try_with(|id| *id)
            .map_err(|_| Error::OutOfRange("caller is not a task of this executor".into()))?;
        self.inner
            .tasks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::OutOfRange(format!("task {id} is no longer tracked")))
    }

    /// Number of tasks not yet finished.
    pub fn active_count(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    /// Stops accepting submissions. With `may_interrupt`, cancels every
    /// in-flight task.
    pub fn shutdown(&self, may_interrupt: bool) {
        self.inner.down.store(true, Ordering::Release);
        if may_interrupt {
            let futures: Vec<TaskFuture<V>> = self
                .inner
                .tasks
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            tracing::debug!(tasks = futures.len(), "executor shutting down with interrupt");
            for future in futures {
                future.cancel();
            }
        }
    }

    /// Waits until every task has finished. `shutdown` must have been
    /// called first.
    pub async fn await_termination(&self) -> Result<()> {
        if !self.inner.down.load(Ordering::Acquire) {
            return Err(Error::Logic(
                "await_termination without a prior shutdown".into(),
            ));
        }
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.tasks.lock().unwrap().is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }
}

impl<V> Drop for Executor<V> {
    fn drop(&mut self) {
        self.inner.down.store(true, Ordering::Release);
        let futures: Vec<TaskFuture<V>> = self
            .inner
            .tasks
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for future in futures {
            future.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn submitted_task_result_is_retrievable() {
        let executor = Executor::new();
        let future = executor.submit(async { Ok(21 * 2) }).unwrap();
        assert_eq!(future.result().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_paused_task() {
        let executor: Executor<()> = Executor::new();
        let future = executor
            .submit(async {
                // Stand-in for pause(): blocks until interrupted.
                std::future::pending::<()>().await;
                Ok(())
            })
            .unwrap();
        tokio::task::yield_now().await;

        future.cancel();
        assert!(future.was_canceled());
        assert!(matches!(future.result().await, Err(Error::Logic(_))));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let executor: Executor<()> = Executor::new();
        executor.shutdown(true);
        assert!(matches!(
            executor.submit(async { Ok(()) }),
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn shutdown_then_await_termination_drains_tasks() {
        let executor: Executor<u32> = Executor::new();
        for n in 0..4 {
            executor
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(n)
                })
                .unwrap();
        }
        let blocked = executor
            .submit(async {
                std::future::pending::<()>().await;
                Ok(99)
            })
            .unwrap();

        executor.shutdown(true);
        executor.await_termination().await.unwrap();
        assert_eq!(executor.active_count(), 0);
        assert!(blocked.was_canceled());
    }

    #[tokio::test]
    async fn await_termination_requires_shutdown() {
        let executor: Executor<()> = Executor::new();
        assert!(matches!(
            executor.await_termination().await,
            Err(Error::Logic(_))
        ));
    }

    #[tokio::test]
    async fn task_can_look_up_its_own_future() {
        let executor: Executor<u64> = Executor::new();
        let executor = Arc::new(executor);
        let inner = executor.clone();
        let future = executor
            .submit(async move {
                let own = inner.current_future()?;
                Ok(own.id())
            })
            .unwrap();
        assert_eq!(future.result().await.unwrap(), future.id());
    }

    #[tokio::test]
    async fn failed_task_rethrows_from_result() {
        let executor: Executor<()> = Executor::new();
        let future = executor
            .submit(async { Err(Error::Runtime("task broke".into())) })
            .unwrap();
        assert!(matches!(future.result().await, Err(Error::Runtime(_))));
    }
}
