//! hycast-runtime — the asynchronous execution substrate: a delay queue for
//! scheduled work, and an executor/future/completer stack for running,
//! canceling, and collecting background tasks.

pub mod completer;
pub mod delay_queue;
pub mod executor;
pub mod future;

pub use completer::Completer;
pub use delay_queue::DelayQueue;
pub use executor::Executor;
pub use future::TaskFuture;
