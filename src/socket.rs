//! The tagged socket record shared by listener, connection, timer, and
//! signal descriptors.

use std::any::Any;
use std::os::fd::RawFd;

use mio::Token;
use rustls::ServerConnection;

use crate::buffer::Buffer;

/// The reader/writer half backing a socket. `Server` sockets carry a real
/// `mio::net::TcpStream` so the TLS adapter and the buffered read/write
/// paths have something implementing `Read + Write` to drive; `Listener`,
/// `Timer`, and `Signal` only ever need a bare descriptor.
pub enum Transport {
    Plain(mio::net::TcpStream),
    Bare(RawFd),
}

impl Transport {
    pub fn raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        match self {
            Transport::Plain(stream) => stream.as_raw_fd(),
            Transport::Bare(fd) => *fd,
        }
    }

    pub fn as_stream_mut(&mut self) -> Option<&mut mio::net::TcpStream> {
        match self {
            Transport::Plain(stream) => Some(stream),
            Transport::Bare(_) => None,
        }
    }
}

/// What kind of descriptor a [`Socket`] wraps. Dispatch in the event loop
/// switches on this tag rather than on trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Listener,
    Server,
    Timer,
    Signal,
}

/// The mutable state behind a [`Socket`]'s lock.
pub struct SocketState {
    /// `None` once the descriptor has been closed and released.
    pub transport: Option<Transport>,
    pub tls: Option<Box<ServerConnection>>,
    pub handshake_done: bool,
    pub read_buffer: Buffer,
    pub request_handle: Option<Box<dyn Any + Send>>,
    /// For `Server`, its `Timer`'s token; for `Timer`, the `Server` it
    /// guards. `None` only during construction, before both halves of a
    /// pair exist.
    pub companion: Option<Token>,
    /// Set by timeout preprocessing; once true a `Server` is never
    /// dispatched `DataAvailable` again, even if its event made it into the
    /// current batch.
    pub timer_expired: bool,
    pub closed: bool,
}

impl SocketState {
    fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            tls: None,
            handshake_done: true,
            read_buffer: Buffer::new(0),
            request_handle: None,
            companion: None,
            timer_expired: false,
            closed: false,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(Transport::raw_fd)
    }
}

/// A slab-owned entry: kind tag plus lock-guarded mutable state. Identified
/// by its `mio::Token`, which doubles as the slab index.
pub struct Socket {
    pub token: Token,
    pub kind: SocketKind,
    pub state: std::sync::Mutex<SocketState>,
}

impl Socket {
    pub fn new_bare(token: Token, kind: SocketKind, fd: RawFd) -> Self {
        Self {
            token,
            kind,
            state: std::sync::Mutex::new(SocketState::new(Transport::Bare(fd))),
        }
    }

    pub fn new_plain_server(token: Token, stream: mio::net::TcpStream) -> Self {
        Self {
            token,
            kind: SocketKind::Server,
            state: std::sync::Mutex::new(SocketState::new(Transport::Plain(stream))),
        }
    }

    pub fn new_secure_server(
        token: Token,
        stream: mio::net::TcpStream,
        tls: ServerConnection,
    ) -> Self {
        let mut state = SocketState::new(Transport::Plain(stream));
        state.handshake_done = false;
        state.tls = Some(Box::new(tls));
        Self {
            token,
            kind: SocketKind::Server,
            state: std::sync::Mutex::new(state),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_listener_starts_handshake_done() {
        let socket = Socket::new_bare(Token(0), SocketKind::Listener, 3);
        assert!(socket.state.lock().unwrap().handshake_done);
    }

    #[test]
    fn timer_kind_has_no_tls() {
        let socket = Socket::new_bare(Token(1), SocketKind::Timer, 4);
        let state = socket.state.lock().unwrap();
        assert!(state.tls.is_none());
        assert!(state.handshake_done);
    }
}
