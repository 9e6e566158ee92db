//! The workspace-wide error type.
//!
//! One enum covers every failure kind the subsystems report. Library code
//! propagates these with `?`; only the daemon wraps them in `anyhow` for
//! context chains.

use std::sync::Arc;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Clone so a shared task future can hand the same failure to every holder.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A caller-supplied value is unusable (bad size, empty name, oversized
    /// datagram).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An index lies outside its container (chunk index past the product's
    /// chunk count).
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// An internal invariant was violated. Fatal to the offending task;
    /// the owning component drops the connection or entry.
    #[error("logic error: {0}")]
    Logic(String),

    /// A recoverable unexpected condition (malformed message id, peer
    /// misbehavior).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// An operating-system call failed.
    #[error("system error: {0}")]
    System(Arc<std::io::Error>),

    /// The remote peer speaks a protocol version we don't.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// A message ended before the decoder got the bytes it needed.
    #[error("short message: needed {needed} bytes, {available} available")]
    ShortMessage { needed: usize, available: usize },

    /// The task was canceled before it produced a result.
    #[error("task canceled")]
    Canceled,

    /// The executor was shut down; no further submissions are accepted.
    #[error("executor is shut down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::System(Arc::new(err))
    }
}

impl Error {
    /// True iff this error means an invariant was broken (as opposed to a
    /// recoverable condition).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Logic(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_names_both_counts() {
        let err = Error::ShortMessage {
            needed: 12,
            available: 3,
        };
        let text = err.to_string();
        assert!(text.contains("12"));
        assert!(text.contains("3"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::System(_)));
    }

    #[test]
    fn only_logic_is_fatal() {
        assert!(Error::Logic("x".into()).is_fatal());
        assert!(!Error::Runtime("x".into()).is_fatal());
        assert!(!Error::Canceled.is_fatal());
    }
}
