//! Executor plus a completion-order output queue.

use std::future::Future;

use tokio::sync::{mpsc, Mutex};

use hycast_core::Result;

use crate::executor::Executor;
use crate::future::TaskFuture;

/// Runs tasks and hands their futures back in the order they finish, not
/// the order they were submitted.
pub struct Completer<V> {
    executor: Executor<V>,
    done_rx: Mutex<mpsc::UnboundedReceiver<TaskFuture<V>>>,
}

impl<V: Clone + Send + 'static> Default for Completer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> Completer<V> {
    pub fn new() -> Self {
        let executor = Executor::new();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        executor.set_completion_sink(done_tx);
        Self {
            executor,
            done_rx: Mutex::new(done_rx),
        }
    }

    /// Submits a task; its future is also queued for `take()` once it
    /// finishes.
    pub fn submit<F>(&self, task: F) -> Result<TaskFuture<V>>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        self.executor.submit(task)
    }

    /// Blocks until some submitted task has finished and returns its
    /// future. Every submitted task appears exactly once, in completion
    /// order.
    pub async fn take(&self) -> Result<TaskFuture<V>> {
        let mut rx = self.done_rx.lock().await;
        rx.recv().await.ok_or(hycast_core::Error::Shutdown)
    }

    pub fn active_count(&self) -> usize {
        self.executor.active_count()
    }

    pub fn shutdown(&self, may_interrupt: bool) {
        self.executor.shutdown(may_interrupt);
    }

    pub async fn await_termination(&self) -> Result<()> {
        self.executor.await_termination().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn futures_arrive_in_completion_order() {
        let completer = Completer::new();
        // Submission order 30, 10, 20 ms — completion order 10, 20, 30.
        for delay_ms in [30u64, 10, 20] {
            completer
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(delay_ms)
                })
                .unwrap();
        }

        let mut results = Vec::new();
        for _ in 0..3 {
            let future = completer.take().await.unwrap();
            results.push(future.result().await.unwrap());
        }
        assert_eq!(results, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn canceled_task_still_reaches_the_queue() {
        let completer: Completer<()> = Completer::new();
        let future = completer
            .submit(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .unwrap();
        tokio::task::yield_now().await;
        future.cancel();

        let done = completer.take().await.unwrap();
        assert_eq!(done.id(), future.id());
        assert!(done.was_canceled());
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let completer: Completer<()> = Completer::new();
        completer.shutdown(true);
        assert!(completer.submit(async { Ok(()) }).is_err());
    }

    #[tokio::test]
    async fn every_task_appears_exactly_once() {
        let completer = Completer::new();
        let count = 8u64;
        for n in 0..count {
            completer.submit(async move { Ok(n) }).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..count {
            let future = completer.take().await.unwrap();
            assert!(seen.insert(future.result().await.unwrap()));
        }
        assert_eq!(seen.len(), count as usize);
    }
}
