//! The readiness queue: a `mio::Poll`-backed, worker-shared source of one
//! event at a time, with two-pass timeout preprocessing baked into the
//! batch refill step.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::descriptor;
use crate::error::{Error, Result};
use crate::socket::SocketKind;

const DEFAULT_CAPACITY: usize = 64;

/// What the next worker pulling an event must do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    /// `token`'s descriptor is readable.
    Readable { token: Token },
    /// `token`'s descriptor reported an error or hangup.
    Closed { token: Token },
    /// This event was voided by timeout preprocessing: a `Server` whose
    /// companion `Timer` fired in the same batch. Skip it.
    Voided,
}

/// Read-only view the queue needs of the socket table to run timeout
/// preprocessing without owning the table itself.
pub trait SocketLookup {
    fn kind(&self, token: Token) -> Option<SocketKind>;
    fn companion(&self, token: Token) -> Option<Token>;
    fn set_timer_expired(&self, token: Token, expired: bool);
    fn is_timer_expired(&self, token: Token) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Wait,
    Process,
}

struct RawItem {
    token: Token,
    readable: bool,
    error: bool,
    voided: bool,
}

struct Batch {
    items: Vec<RawItem>,
    i_ready: usize,
    state: BatchState,
}

struct KernelWait {
    poll: Poll,
    events: Events,
}

/// Shared, worker-pollable readiness source. See the module docs above.
pub struct ReadinessQueue {
    kernel: Mutex<KernelWait>,
    batch: Mutex<Batch>,
    signal_reader: RawFd,
    signal_writer: RawFd,
    _signal_pair: descriptor::SignalPair,
    shutdown: AtomicBool,
    live_workers: AtomicUsize,
}

pub const SIGNAL_TOKEN: Token = Token(usize::MAX);

impl ReadinessQueue {
    /// Allocates the kernel readiness object, the scratch event array, and
    /// the shutdown signal pair; registers the signal reader level-triggered.
    pub fn create(n_workers: u32) -> Result<Self> {
        let poll = Poll::new().map_err(Error::ResourceExhausted)?;
        let signal_pair = descriptor::create_signal_pair()?;
        let signal_reader = descriptor::as_raw(&signal_pair.reader);
        let signal_writer = descriptor::as_raw(&signal_pair.writer);

        poll.registry()
            .register(
                &mut SourceFd(&signal_reader),
                SIGNAL_TOKEN,
                Interest::READABLE,
            )
            .map_err(Error::SyscallFailed)?;

        Ok(Self {
            kernel: Mutex::new(KernelWait {
                poll,
                events: Events::with_capacity(DEFAULT_CAPACITY),
            }),
            batch: Mutex::new(Batch {
                items: Vec::new(),
                i_ready: 0,
                state: BatchState::Wait,
            }),
            signal_reader,
            signal_writer,
            _signal_pair: signal_pair,
            shutdown: AtomicBool::new(false),
            live_workers: AtomicUsize::new(n_workers as usize),
        })
    }

    pub fn registry_register(&self, fd: RawFd, token: Token) -> Result<()> {
        self.kernel
            .lock()
            .unwrap()
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
            .map_err(Error::SyscallFailed)
    }

    /// Re-arms a one-shot registration. One-shot semantics come from never
    /// calling this until the worker that consumed the previous event is
    /// done with the descriptor; edge-triggered delivery means no repeat
    /// notification fires in between.
    pub fn registry_reregister(&self, fd: RawFd, token: Token) -> Result<()> {
        self.kernel
            .lock()
            .unwrap()
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, Interest::READABLE)
            .map_err(Error::SyscallFailed)
    }

    /// Idempotent: a descriptor already gone (e.g. voided by timeout
    /// preprocessing) just logs a warning rather than failing.
    pub fn registry_remove(&self, fd: RawFd) {
        let kernel = self.kernel.lock().unwrap();
        if let Err(e) = kernel.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::warn!("deregistering fd {fd} failed (already gone?): {e}");
        }
    }

    /// Pops exactly one event, refilling the batch from the kernel when
    /// empty. Blocks indefinitely in the kernel wait; the cursor lock is not
    /// held during that wait, so other workers can drain an already
    /// materialized batch concurrently.
    pub fn next_event(&self, lookup: &dyn SocketLookup) -> Result<RawEvent> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::ShutdownInProgress);
            }

            let mut batch = self.batch.lock().unwrap();
            if batch.state == BatchState::Wait {
                drop(batch);
                self.refill()?;
                batch = self.batch.lock().unwrap();
                if batch.state == BatchState::Wait {
                    // Another worker refilled and immediately drained the
                    // batch before we reacquired the lock; loop and try
                    // again rather than spin here.
                    continue;
                }
            }

            if batch.i_ready == 0 {
                self.preprocess_timeouts(&mut batch.items, lookup);
            }

            if batch.i_ready >= batch.items.len() {
                batch.state = BatchState::Wait;
                continue;
            }

            let item = &batch.items[batch.i_ready];
            if item.token == SIGNAL_TOKEN {
                descriptor::signal_drain_one(self.signal_reader);
                batch.i_ready += 1;
                if batch.i_ready >= batch.items.len() {
                    batch.state = BatchState::Wait;
                }
                return Err(Error::ShutdownInProgress);
            }
            let event = if item.voided {
                RawEvent::Voided
            } else if item.error {
                RawEvent::Closed { token: item.token }
            } else if item.readable {
                RawEvent::Readable { token: item.token }
            } else {
                RawEvent::Voided
            };

            batch.i_ready += 1;
            if batch.i_ready >= batch.items.len() {
                batch.state = BatchState::Wait;
            }
            return Ok(event);
        }
    }

    /// Runs the kernel wait exactly once, under the dedicated kernel lock,
    /// then materializes the result into the batch under the cursor lock.
    /// Re-checks under the batch lock so a racing refill from another
    /// worker isn't clobbered.
    fn refill(&self) -> Result<()> {
        let mut kernel = self.kernel.lock().unwrap();

        loop {
            match kernel.poll.poll(&mut kernel.events, None) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::SyscallFailed(e)),
            }
        }

        let items: Vec<RawItem> = kernel
            .events
            .iter()
            .map(|ev| RawItem {
                token: ev.token(),
                readable: ev.is_readable(),
                error: ev.is_error() || ev.is_read_closed() || ev.is_write_closed(),
                voided: false,
            })
            .collect();

        let mut batch = self.batch.lock().unwrap();
        if batch.state == BatchState::Wait {
            batch.items = items;
            batch.i_ready = 0;
            batch.state = BatchState::Process;
        }
        Ok(())
    }

    /// First pass marks every `Server` companion of a fired `Timer`
    /// expired; second pass voids the `Server`'s own event if it also fired
    /// in this batch. Guarantees at most one of {data, timeout} dispatches
    /// per connection per batch.
    fn preprocess_timeouts(&self, items: &mut [RawItem], lookup: &dyn SocketLookup) {
        let mut any_timer = false;
        for item in items.iter() {
            if lookup.kind(item.token) == Some(SocketKind::Timer) {
                if let Some(server_token) = lookup.companion(item.token) {
                    lookup.set_timer_expired(server_token, true);
                    any_timer = true;
                }
            }
        }
        if !any_timer {
            return;
        }
        for item in items.iter_mut() {
            if lookup.kind(item.token) == Some(SocketKind::Server) && lookup.is_timer_expired(item.token)
            {
                item.voided = true;
            }
        }
    }

    /// Sets the shutdown flag and writes one wakeup byte per worker so that
    /// every blocked worker, not just one, observes shutdown.
    pub fn shutdown(&self, n_workers: u32) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        for _ in 0..n_workers {
            descriptor::signal_wake(self.signal_writer)?;
        }
        Ok(())
    }

    /// Called by a worker after observing `Error::ShutdownInProgress`.
    /// Returns `true` if this was the last live worker, meaning the queue
    /// may now be torn down.
    pub fn worker_exit(&self) -> bool {
        self.live_workers.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn is_in_use(&self) -> bool {
        self.live_workers.load(Ordering::SeqCst) > 0
    }

    /// Polls `is_in_use` for up to `wait_seconds`, sleeping between checks,
    /// for a bounded shutdown drain wait.
    pub fn wait_for_quiescence(&self, wait_seconds: u32) -> Result<()> {
        for _ in 0..wait_seconds {
            if !self.is_in_use() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        if self.is_in_use() {
            Err(Error::EngineFailure)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeLookup {
        kinds: HashMap<Token, SocketKind>,
        companions: HashMap<Token, Token>,
        expired: StdMutex<HashMap<Token, bool>>,
    }

    impl SocketLookup for FakeLookup {
        fn kind(&self, token: Token) -> Option<SocketKind> {
            self.kinds.get(&token).copied()
        }
        fn companion(&self, token: Token) -> Option<Token> {
            self.companions.get(&token).copied()
        }
        fn set_timer_expired(&self, token: Token, expired: bool) {
            self.expired.lock().unwrap().insert(token, expired);
        }
        fn is_timer_expired(&self, token: Token) -> bool {
            *self.expired.lock().unwrap().get(&token).unwrap_or(&false)
        }
    }

    #[test]
    fn preprocess_voids_server_sharing_batch_with_its_timer() {
        let server = Token(1);
        let timer = Token(2);
        let lookup = FakeLookup {
            kinds: HashMap::from([(server, SocketKind::Server), (timer, SocketKind::Timer)]),
            companions: HashMap::from([(timer, server)]),
            expired: StdMutex::new(HashMap::new()),
        };
        let queue = ReadinessQueue::create(1).expect("queue");
        let mut items = vec![
            RawItem {
                token: server,
                readable: true,
                error: false,
                voided: false,
            },
            RawItem {
                token: timer,
                readable: true,
                error: false,
                voided: false,
            },
        ];
        queue.preprocess_timeouts(&mut items, &lookup);
        assert!(items[0].voided);
        assert!(!items[1].voided);
    }

    #[test]
    fn shutdown_then_next_event_reports_shutdown() {
        let queue = ReadinessQueue::create(1).expect("queue");
        let lookup = FakeLookup {
            kinds: HashMap::new(),
            companions: HashMap::new(),
            expired: StdMutex::new(HashMap::new()),
        };
        queue.shutdown(1).expect("shutdown");
        let result = queue.next_event(&lookup);
        assert!(matches!(result, Err(Error::ShutdownInProgress)));
        assert!(queue.worker_exit());
    }
}
