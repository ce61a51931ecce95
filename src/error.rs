//! Typed errors returned by the transport core.

use std::io;

/// Every failure mode the transport core can surface to an embedder.
///
/// Per-event failures (a bad read, a failed accept) never propagate past the
/// worker loop that observed them — the affected socket is closed and the
/// worker continues. Only [`Error::ShutdownInProgress`] is allowed to end a
/// worker's loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned from `next_event` once shutdown has been requested; the
    /// worker observing this should exit its loop.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// A syscall (bind, listen, epoll_ctl, timerfd_create, ...) failed.
    #[error("syscall failed: {0}")]
    SyscallFailed(#[source] io::Error),

    /// A caller passed an invalid parameter (null handle, zero-length slice
    /// where one was required, etc).
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The supplied [`crate::config::Config`] is not internally consistent
    /// (e.g. `is_secure` without certificate material or a prebuilt context).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The non-blocking TLS handshake failed outright (not a `WantRead`/
    /// `WantWrite` retry).
    #[error("TLS accept failed: {0}")]
    TlsAcceptFailed(#[source] rustls::Error),

    /// TLS library or context construction failed.
    #[error("TLS error: {0}")]
    TlsError(#[source] rustls::Error),

    /// A connection's request exceeded `max_data_per_conn`.
    #[error("request body over limit")]
    OverLimit,

    /// A read failed: peer closed, or a non-transient errno.
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// A write failed, including exhausting the retry-with-backoff ladder.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// Orderly shutdown did not complete within the configured wait.
    #[error("engine failed to quiesce within the wait budget")]
    EngineFailure,

    /// A kernel resource (epoll instance, timerfd, socketpair) could not be
    /// allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[source] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the handful of errno values that mean "try again later"
    /// rather than "the operation failed".
    pub fn is_transient_io(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}
