//! Top-level wiring: owns the listener, the readiness queue, the socket
//! table, and the worker threads; implements [`Connections`] so a
//! [`Handler`] can read/write/close connections by token.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mio::Token;
use slab::Slab;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{Connections, Handler};
use crate::io;
use crate::listener::Listener;
use crate::queue::{RawEvent, ReadinessQueue, SocketLookup};
use crate::socket::{Socket, SocketKind};
use crate::timer;
use crate::tls;

/// Reserved token for the listening socket; distinct from
/// [`crate::queue::SIGNAL_TOKEN`] and from every slab-issued token, since
/// the slab never grows anywhere near `usize::MAX - 1` connections.
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Owns every live `Socket`, keyed by its slab-issued token. Implements
/// [`SocketLookup`] so the readiness queue can run timeout preprocessing
/// without knowing about the engine.
struct Sockets {
    slab: Mutex<Slab<Arc<Socket>>>,
}

impl Sockets {
    fn new() -> Self {
        Self {
            slab: Mutex::new(Slab::new()),
        }
    }

    fn get(&self, token: Token) -> Option<Arc<Socket>> {
        self.slab.lock().unwrap().get(token.0).cloned()
    }

    fn insert(&self, make: impl FnOnce(Token) -> Socket) -> Arc<Socket> {
        let mut slab = self.slab.lock().unwrap();
        let entry = slab.vacant_entry();
        let token = Token(entry.key());
        let socket = Arc::new(make(token));
        entry.insert(socket.clone());
        socket
    }

    fn remove(&self, token: Token) {
        self.slab.lock().unwrap().try_remove(token.0);
    }
}

impl SocketLookup for Sockets {
    fn kind(&self, token: Token) -> Option<SocketKind> {
        self.get(token).map(|s| s.kind)
    }

    fn companion(&self, token: Token) -> Option<Token> {
        self.get(token)?.state.lock().unwrap().companion
    }

    fn set_timer_expired(&self, token: Token, expired: bool) {
        if let Some(socket) = self.get(token) {
            socket.state.lock().unwrap().timer_expired = expired;
        }
    }

    fn is_timer_expired(&self, token: Token) -> bool {
        self.get(token)
            .map(|s| s.state.lock().unwrap().timer_expired)
            .unwrap_or(false)
    }
}

/// The running transport core. Construct with [`Engine::start`]; tear down
/// with [`Engine::shutdown`].
pub struct Engine {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    listener: Listener,
    queue: ReadinessQueue,
    sockets: Sockets,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    handler: Arc<dyn Handler>,
}

impl Engine {
    /// Binds the listener, initializes TLS if configured, spawns
    /// `n_worker_threads` workers, and returns once they're all running.
    pub fn start(config: Config, handler: Arc<dyn Handler>) -> Result<Self> {
        config.validate()?;

        let listener = Listener::start(&config)?;
        let tls_config = if config.is_secure {
            Some(tls::init(&config)?)
        } else {
            None
        };

        let queue = ReadinessQueue::create(config.n_worker_threads)?;
        queue.registry_register(listener.raw_fd(), LISTENER_TOKEN)?;

        let inner = Arc::new(Inner {
            config: config.clone(),
            listener,
            queue,
            sockets: Sockets::new(),
            tls_config,
            handler,
        });

        let mut workers = Vec::with_capacity(config.n_worker_threads as usize);
        for id in 0..config.n_worker_threads {
            let inner = inner.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("restige-worker-{id}"))
                    .spawn(move || worker_loop(inner))
                    .map_err(Error::SyscallFailed)?,
            );
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Requests shutdown, waits up to `wait_seconds` for every worker to
    /// drain and exit, then joins their threads. Releases the TLS init
    /// reference if this engine held one.
    pub fn shutdown(&self, wait_seconds: u32) -> Result<()> {
        self.inner.queue.shutdown(self.inner.config.n_worker_threads)?;
        let outcome = self.inner.queue.wait_for_quiescence(wait_seconds);

        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }

        if self.inner.config.is_secure {
            tls::release();
        }

        outcome
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        match inner.queue.next_event(&inner.sockets) {
            Ok(RawEvent::Voided) => continue,
            Ok(RawEvent::Closed { token }) => handle_closed(&inner, token),
            Ok(RawEvent::Readable { token }) => handle_readable(&inner, token),
            Err(Error::ShutdownInProgress) => {
                if inner.queue.worker_exit() {
                    log::info!("last worker exiting, queue drained");
                }
                return;
            }
            Err(e) => {
                log::error!("readiness queue error, worker exiting: {e}");
                return;
            }
        }
    }
}

fn handle_readable(inner: &Arc<Inner>, token: Token) {
    if token == LISTENER_TOKEN {
        accept_loop(inner);
        return;
    }

    let Some(socket) = inner.sockets.get(token) else {
        log::warn!("readable event for unknown token {token:?}");
        return;
    };

    match socket.kind {
        SocketKind::Timer => handle_timer_fired(inner, &socket),
        SocketKind::Server => handle_server_readable(inner, &socket),
        SocketKind::Listener | SocketKind::Signal => {
            log::warn!("unexpected readable event on {:?} socket", socket.kind)
        }
    }
}

fn handle_closed(inner: &Arc<Inner>, token: Token) {
    let Some(socket) = inner.sockets.get(token) else {
        return;
    };
    if socket.kind == SocketKind::Server {
        inner.handler.on_close(token, inner.as_ref());
        close_connection(inner, token);
    }
}

fn accept_loop(inner: &Arc<Inner>) {
    loop {
        let accepted = inner.inner_accept();
        let (stream, _addr) = match accepted {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(e) => {
                log::warn!("accept failed: {e}");
                return;
            }
        };

        let timeout_ms = u64::from(inner.config.conn_timeout_sec) * 1000;

        let timer_fd = match timer::create() {
            Ok(fd) => fd,
            Err(e) => {
                log::warn!("timerfd_create failed, dropping connection: {e}");
                continue;
            }
        };

        let server_socket = match &inner.tls_config {
            Some(shared) => match tls::new_session(shared) {
                Ok(session) => inner
                    .sockets
                    .insert(|token| Socket::new_secure_server(token, stream, session)),
                Err(e) => {
                    log::warn!("TLS session creation failed, dropping connection: {e}");
                    timer::close(timer_fd);
                    continue;
                }
            },
            None => inner
                .sockets
                .insert(|token| Socket::new_plain_server(token, stream)),
        };

        let timer_socket = inner
            .sockets
            .insert(|token| Socket::new_bare(token, SocketKind::Timer, timer_fd));

        server_socket.state.lock().unwrap().companion = Some(timer_socket.token);
        timer_socket.state.lock().unwrap().companion = Some(server_socket.token);

        let server_fd = server_socket.state.lock().unwrap().raw_fd().unwrap();
        if let Err(e) = inner.queue.registry_register(server_fd, server_socket.token) {
            log::warn!("registering new connection failed: {e}");
            inner.sockets.remove(server_socket.token);
            inner.sockets.remove(timer_socket.token);
            timer::close(timer_fd);
            continue;
        }
        if let Err(e) = inner.queue.registry_register(timer_fd, timer_socket.token) {
            log::warn!("registering connection timer failed: {e}");
        }
        if let Err(e) = timer::arm(timer_fd, timeout_ms) {
            log::warn!("arming connection timer failed: {e}");
        }

        inner.handler.on_new(server_socket.token, inner.as_ref());
    }
}

fn handle_timer_fired(inner: &Arc<Inner>, timer_socket: &Arc<Socket>) {
    timer::drain(timer_socket.state.lock().unwrap().raw_fd().unwrap_or(-1));

    let server_token = timer_socket.state.lock().unwrap().companion;
    let Some(server_token) = server_token else {
        return;
    };
    let Some(server_socket) = inner.sockets.get(server_token) else {
        return;
    };

    {
        let mut state = server_socket.state.lock().unwrap();
        if let Some(fd) = state.raw_fd() {
            inner.queue.registry_remove(fd);
        }
        // Already removed above; tell close() not to remove it again.
        state.timer_expired = true;
    }

    let handshake_incomplete = !server_socket.state.lock().unwrap().handshake_done;
    if inner.tls_config.is_some() && handshake_incomplete {
        close_connection(inner, server_socket.token);
        return;
    }

    inner.handler.on_timeout(server_token, inner.as_ref());
    close_connection(inner, server_socket.token);
}

fn handle_server_readable(inner: &Arc<Inner>, socket: &Arc<Socket>) {
    {
        let state = socket.state.lock().unwrap();
        if let Some(timer_token) = state.companion {
            if let Some(timer_socket) = inner.sockets.get(timer_token) {
                let _ = timer::disarm(timer_socket.state.lock().unwrap().raw_fd().unwrap_or(-1));
            }
        }
    }

    let needs_handshake = {
        let state = socket.state.lock().unwrap();
        state.tls.is_some() && !state.handshake_done
    };

    if needs_handshake {
        let mut state = socket.state.lock().unwrap();
        let SocketStateParts { tls, transport, .. } = split_state(&mut state);
        let session = tls.as_mut().expect("checked above");
        let stream = match transport.as_stream_mut() {
            Some(stream) => stream,
            None => return,
        };
        match tls::drive_handshake(session, stream) {
            Ok(tls::HandshakeProgress::Complete) => state.handshake_done = true,
            Ok(tls::HandshakeProgress::Incomplete) => {}
            Err(e) => {
                log::warn!("TLS handshake failed: {e}");
                drop(state);
                close_connection(inner, socket.token);
                return;
            }
        }
        drop(state);
        rearm_connection(inner, socket);
        return;
    }

    if let Err(e) = io::read(&mut socket.state.lock().unwrap(), inner.config.max_data_per_conn as usize)
    {
        log::warn!("read failed, closing connection: {e}");
        close_connection(inner, socket.token);
        return;
    }

    inner.handler.on_data(socket.token, inner.as_ref());
}

/// Splits a `&mut SocketState` into independently-borrowable parts; used
/// where the borrow checker can't see that `tls` and `transport` are
/// disjoint fields through a method call boundary.
struct SocketStateParts<'a> {
    tls: &'a mut Option<Box<rustls::ServerConnection>>,
    transport: &'a mut crate::socket::Transport,
}

fn split_state(state: &mut crate::socket::SocketState) -> SocketStateParts<'_> {
    SocketStateParts {
        tls: &mut state.tls,
        transport: state.transport.as_mut().expect("socket already closed"),
    }
}

/// Re-arms a connection's one-shot registration and its timer. Shared by
/// the post-handshake path (`handle_server_readable`) and `set_request`'s
/// keep-alive/continue-parsing outcomes.
fn rearm_connection(inner: &Inner, socket: &Arc<Socket>) {
    let (fd, timer_token) = {
        let state = socket.state.lock().unwrap();
        (state.raw_fd(), state.companion)
    };
    if let Some(fd) = fd {
        if let Err(e) = inner.queue.registry_reregister(fd, socket.token) {
            log::warn!("re-arming connection failed: {e}");
        }
    }
    if let Some(timer_token) = timer_token {
        if let Some(timer_socket) = inner.sockets.get(timer_token) {
            let timer_fd = timer_socket.state.lock().unwrap().raw_fd();
            if let Some(timer_fd) = timer_fd {
                let timeout_ms = u64::from(inner.config.conn_timeout_sec) * 1000;
                let _ = timer::arm(timer_fd, timeout_ms);
                let _ = inner.queue.registry_reregister(timer_fd, timer_token);
            }
        }
    }
}

/// Shared with `Connections::close` — a free function here so call sites
/// that only hold `&Arc<Inner>` (not `&dyn Connections`) can still reach it.
fn close_connection(inner: &Arc<Inner>, token: Token) {
    Connections::close(inner.as_ref(), token);
}

impl Inner {
    /// One non-blocking `accept`; `Ok(None)` means the listener's backlog
    /// is drained for now (`WouldBlock`).
    fn inner_accept(&self) -> std::io::Result<Option<(mio::net::TcpStream, std::net::SocketAddr)>> {
        match self.listener.inner.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(e) if Error::is_transient_io(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Connections for Inner {
    fn read_buffered(&self, token: Token) -> Option<Vec<u8>> {
        let socket = self.sockets.get(token)?;
        let state = socket.state.lock().unwrap();
        Some(state.read_buffer.to_vec())
    }

    fn take_request(&self, token: Token) -> Option<Box<dyn Any + Send>> {
        let socket = self.sockets.get(token)?;
        socket.state.lock().unwrap().request_handle.take()
    }

    fn write(&self, token: Token, buf: &[u8]) -> Result<()> {
        let socket = self
            .sockets
            .get(token)
            .ok_or(Error::InvalidParam("write on unknown token"))?;
        io::write(&mut socket.state.lock().unwrap(), buf)
    }

    fn set_request(
        &self,
        token: Token,
        request: Option<Box<dyn Any + Send>>,
        n_consumed: usize,
        keep_alive: bool,
    ) {
        let Some(socket) = self.sockets.get(token) else {
            return;
        };

        let should_rearm = {
            let mut state = socket.state.lock().unwrap();
            if let Some(req) = request {
                state.request_handle = Some(req);
                state.read_buffer.mark_read(n_consumed);
                true
            } else if keep_alive {
                state.request_handle = None;
                state.read_buffer.mark_read(n_consumed);
                true
            } else {
                state.request_handle = None;
                false
            }
        };

        if should_rearm {
            rearm_connection(self, &socket);
        } else {
            self.close(token);
        }
    }

    fn close(&self, token: Token) {
        let Some(socket) = self.sockets.get(token) else {
            return;
        };

        if let Some(timer_token) = socket.state.lock().unwrap().companion {
            if let Some(timer_socket) = self.sockets.get(timer_token) {
                let mut timer_state = timer_socket.state.lock().unwrap();
                if let Some(fd) = timer_state.raw_fd() {
                    self.queue.registry_remove(fd);
                    timer::close(fd);
                }
                timer_state.transport = None;
                timer_state.closed = true;
                drop(timer_state);
                self.sockets.remove(timer_token);
            }
        }

        let mut state = socket.state.lock().unwrap();
        if socket.kind == SocketKind::Server && !state.timer_expired {
            if let Some(fd) = state.raw_fd() {
                self.queue.registry_remove(fd);
            }
        }
        if let Some(tls) = state.tls.as_mut() {
            if state.handshake_done {
                tls.send_close_notify();
            }
        }
        state.tls = None;
        state.transport = None;
        state.closed = true;
        drop(state);
        self.sockets.remove(token);
    }
}
