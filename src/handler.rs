//! The contract between the transport core and the external request
//! handler. HTTP parsing and semantics live entirely on the other side of
//! this trait — the core only ever hands over raw bytes and an opaque
//! per-connection handle; it never inspects either.

use std::any::Any;

use mio::Token;

use crate::error::Result;

/// The engine's callback surface back to a `Handler`, addressed by the
/// connection's `Token` rather than a borrowed `Socket` so a handler can
/// stash the token and call back later without fighting the borrow
/// checker.
pub trait Connections: Send + Sync {
    /// Unconsumed bytes currently sitting in the connection's read buffer
    /// (`[n_consumed, n_valid)`). `None` if the token no longer names a
    /// live connection.
    fn read_buffered(&self, token: Token) -> Option<Vec<u8>>;

    /// Returns whatever opaque parser state was stashed by a previous
    /// `set_request` call on this connection, removing it from the socket.
    fn take_request(&self, token: Token) -> Option<Box<dyn Any + Send>>;

    /// Writes `buf` to the connection, retrying through transient
    /// `WouldBlock`/TLS `WantWrite` with backoff.
    fn write(&self, token: Token, buf: &[u8]) -> Result<()>;

    /// Must be called exactly once per `on_data` invocation:
    /// - `request = Some(_)`: still parsing; stash it with `n_consumed`,
    ///   re-arm timer and socket.
    /// - `request = None, keep_alive = true`: request complete; clear the
    ///   read buffer, re-arm timer and socket.
    /// - `request = None, keep_alive = false`: do not re-arm; the engine
    ///   closes the connection.
    fn set_request(
        &self,
        token: Token,
        request: Option<Box<dyn Any + Send>>,
        n_consumed: usize,
        keep_alive: bool,
    );

    /// Closes the connection and its companion timer immediately. Used by
    /// `on_timeout`/`on_close` implementations, and by handlers that decide
    /// mid-`on_data` that the connection is unsalvageable.
    fn close(&self, token: Token);
}

/// Implemented by the embedding application.
pub trait Handler: Send + Sync {
    /// Invoked once per accepted connection, immediately after accept and
    /// registration — including for TLS connections whose handshake has
    /// not completed yet.
    fn on_new(&self, token: Token, conn: &dyn Connections);

    /// Invoked whenever the socket becomes readable, its TLS handshake (if
    /// any) is complete, and the engine has appended newly read bytes to
    /// the connection's buffer.
    fn on_data(&self, token: Token, conn: &dyn Connections);

    /// Connection was idle longer than `conn_timeout_sec`.
    fn on_timeout(&self, token: Token, conn: &dyn Connections);

    /// Peer-initiated or error close.
    fn on_close(&self, token: Token, conn: &dyn Connections);
}
