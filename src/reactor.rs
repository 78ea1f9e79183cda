//! Event loop state
//!
//! A [`Reactor`] bridges libcurl's multi socket interface to a `mio` poll.
//! libcurl tells it which sockets to watch through the socket callback and
//! when to wake up through the timer callback; the reactor polls, feeds
//! readiness back with `curl_multi_socket_action`, and collects finished
//! transfers. It also owns the one-shot retry timers.
//!
//! The engine keeps the reactor behind its loop mutex. Whoever holds that
//! mutex is the only party touching the multi handle.

use crate::code::{Code, Internal};
use crate::error::Error;
use crate::sink::Sink;
use crate::wrapper::Completion;
use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Events, Multi, Socket, SocketEvents};
use mio::unix::SourceFd;
use mio::{Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

const WAKER: Token = Token(usize::MAX);

/// Watched sockets and the interest libcurl last asked for.
type SocketTable = Arc<Mutex<HashMap<Socket, Interest>>>;

/// A settled transfer on its way to its handle.
pub(crate) struct Delivery {
    pub(crate) target: Arc<dyn Completion>,
    pub(crate) code: Code,
    pub(crate) easy: Option<Easy2<Sink>>,
}

/// Transfers registered with the multiplexer, observed on every change.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Stats {
    fn record(&self, current: usize) {
        self.current.store(current, Ordering::Release);
        self.peak.fetch_max(current, Ordering::AcqRel);
    }

    pub(crate) fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

struct Transfer {
    handle: Easy2Handle<Sink>,
    target: Arc<dyn Completion>,
}

struct Retry {
    token: usize,
    due: Instant,
    easy: Easy2<Sink>,
    target: Arc<dyn Completion>,
}

pub(crate) struct Reactor {
    // Declared before `multi` so easy handles detach before the multi handle
    // is cleaned up.
    transfers: HashMap<usize, Transfer>,
    retries: Vec<Retry>,
    multi: Multi,
    poll: Poll,
    events: mio::Events,
    waker: Arc<Waker>,
    sockets: SocketTable,
    // The loop-owned timer: when libcurl wants `curl_multi_socket_action`
    // called with CURL_SOCKET_TIMEOUT.
    deadline: Arc<Mutex<Option<Instant>>>,
    stats: Arc<Stats>,
    safety_timeout: Duration,
}

// `Easy2Handle` is neither Send nor Sync because it is bound to its multi
// handle. libcurl allows a multi handle and its easy handles to move between
// threads as long as calls are never concurrent, and the engine only reaches
// the reactor through its loop mutex.
unsafe impl Send for Reactor {}

impl Reactor {
    pub(crate) fn new(stats: Arc<Stats>, safety_timeout: Duration) -> Result<Self, Error> {
        let poll = Poll::new().map_err(Error::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(Error::Poll)?);
        let registry = poll.registry().try_clone().map_err(Error::Poll)?;

        let sockets = SocketTable::default();
        let deadline = Arc::new(Mutex::new(None));
        let mut multi = Multi::new();

        let table = Arc::clone(&sockets);
        multi.socket_function(move |socket, events, _| {
            socket_changed(&registry, &table, socket, events);
        })?;

        let timer = Arc::clone(&deadline);
        multi.timer_function(move |timeout| {
            *timer.lock() = timeout.map(|delay| Instant::now() + delay);
            true
        })?;

        Ok(Self {
            transfers: HashMap::new(),
            retries: Vec::new(),
            multi,
            poll,
            events: mio::Events::with_capacity(256),
            waker,
            sockets,
            deadline,
            stats,
            safety_timeout,
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    fn is_active(&self) -> bool {
        !self.transfers.is_empty() || !self.retries.is_empty()
    }

    /// Hand an easy handle to the multiplexer under `token`.
    ///
    /// On failure the easy handle comes back when the multiplexer still
    /// returned it.
    pub(crate) fn register(
        &mut self,
        token: usize,
        easy: Easy2<Sink>,
        target: Arc<dyn Completion>,
    ) -> Result<(), Option<Easy2<Sink>>> {
        let mut handle = self.multi.add2(easy).map_err(|err| {
            warn!(token, %err, "multiplexer refused transfer");
            None
        })?;

        if let Err(err) = handle.set_token(token) {
            warn!(token, %err, "failed to tag transfer");
            return Err(self.multi.remove2(handle).ok());
        }

        self.transfers.insert(token, Transfer { handle, target });
        self.stats.record(self.transfers.len());
        Ok(())
    }

    /// Pull a transfer out of the multiplexer or the retry queue.
    ///
    /// Returns the aborted completion only when something was removed.
    pub(crate) fn unregister(&mut self, token: usize) -> Option<Delivery> {
        if let Some(Transfer { handle, target }) = self.transfers.remove(&token) {
            self.stats.record(self.transfers.len());
            let easy = self
                .multi
                .remove2(handle)
                .map_err(|err| warn!(token, %err, "failed to detach aborted transfer"))
                .ok();
            return Some(Delivery {
                target,
                code: Code::ABORTED,
                easy,
            });
        }

        let index = self.retries.iter().position(|retry| retry.token == token)?;
        let Retry { easy, target, .. } = self.retries.swap_remove(index);
        Some(Delivery {
            target,
            code: Code::ABORTED,
            easy: Some(easy),
        })
    }

    /// One loop iteration: poll, drive libcurl, collect finished transfers,
    /// fire due retries. Returns whether anything is still in flight.
    pub(crate) fn run_once(&mut self, deliveries: &mut Vec<Delivery>) -> bool {
        let active = self.is_active();
        let timeout = self.poll_timeout(active);

        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(%err, "poll failed");
            }
        }

        let ready: Vec<(Socket, Events)> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER)
            .map(|event| {
                let mut events = Events::new();
                events.input(event.is_readable() || event.is_read_closed());
                events.output(event.is_writable() || event.is_write_closed());
                events.error(event.is_error());
                (event.token().0 as Socket, events)
            })
            .collect();
        let quiet = self.events.is_empty();

        for (socket, events) in &ready {
            if let Err(err) = self.multi.action(*socket, events) {
                warn!(socket, %err, "socket action failed");
            }
            self.rearm(*socket);
        }

        let now = Instant::now();
        let timer_fired = {
            let mut deadline = self.deadline.lock();
            match *deadline {
                Some(due) if due <= now => {
                    *deadline = None;
                    true
                }
                _ => false,
            }
        };

        // A quiet poll while transfers are pending also kicks libcurl's
        // timeout handling, so a lost timer update cannot stall a transfer.
        let kicked = timer_fired || (active && quiet);
        if kicked {
            if let Err(err) = self.multi.timeout() {
                warn!(%err, "timeout action failed");
            }
        }

        if kicked || !ready.is_empty() {
            self.collect_finished(deliveries);
        }
        self.fire_retries(now, deliveries);
        self.is_active()
    }

    fn poll_timeout(&self, active: bool) -> Duration {
        if !active {
            return Duration::ZERO;
        }
        let timer = *self.deadline.lock();
        let retry = self.retries.iter().map(|retry| retry.due).min();
        match timer.into_iter().chain(retry).min() {
            Some(due) => due
                .saturating_duration_since(Instant::now())
                .min(self.safety_timeout),
            None => self.safety_timeout,
        }
    }

    // mio readiness is edge-triggered while libcurl may leave data unread;
    // re-registering makes the poll report a socket that is still ready.
    fn rearm(&self, socket: Socket) {
        let Some(interest) = self.sockets.lock().get(&socket).copied() else {
            return;
        };
        let result =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&socket), Token(socket as usize), interest);
        if let Err(err) = result {
            trace!(socket, %err, "failed to re-arm socket");
        }
    }

    fn collect_finished(&mut self, deliveries: &mut Vec<Delivery>) {
        let mut finished = Vec::new();
        self.multi.messages(|message| {
            if let (Ok(token), Some(result)) = (message.token(), message.result()) {
                finished.push((token, result));
            }
        });

        for (token, result) in finished {
            // A token that is no longer registered was aborted meanwhile.
            let Some(Transfer { handle, target }) = self.transfers.remove(&token) else {
                continue;
            };
            self.stats.record(self.transfers.len());

            let (code, easy) = match (result, self.multi.remove2(handle)) {
                (Err(err), removed) => (Code::Transfer(err.code()), removed.ok()),
                (Ok(()), Ok(mut easy)) => {
                    let code = easy
                        .response_code()
                        .map_or_else(|err| Code::Transfer(err.code()), Code::Status);
                    (code, Some(easy))
                }
                (Ok(()), Err(err)) => {
                    warn!(token, %err, "failed to detach finished transfer");
                    (Code::Internal(Internal::Multiplexer), None)
                }
            };
            trace!(token, %code, "transfer finished");
            self.request_completed(token, target, code, easy, deliveries);
        }
    }

    fn request_completed(
        &mut self,
        token: usize,
        target: Arc<dyn Completion>,
        code: Code,
        easy: Option<Easy2<Sink>>,
        deliveries: &mut Vec<Delivery>,
    ) {
        let retry = easy.is_some()
            && code.is_safe_to_retry(|status| target.retries_on_status(status))
            && target.can_reattempt();

        match easy {
            Some(easy) if retry => {
                let delay = target.retry_delay();
                trace!(token, %code, ?delay, "scheduling retry");
                self.retries.push(Retry {
                    token,
                    due: Instant::now() + delay,
                    easy,
                    target,
                });
            }
            easy => deliveries.push(Delivery { target, code, easy }),
        }
    }

    fn fire_retries(&mut self, now: Instant, deliveries: &mut Vec<Delivery>) {
        let mut index = 0;
        while index < self.retries.len() {
            if self.retries[index].due > now {
                index += 1;
                continue;
            }

            let Retry {
                token,
                mut easy,
                target,
                ..
            } = self.retries.swap_remove(index);
            easy.get_mut().reset_response();
            trace!(token, "retrying transfer");

            if let Err(easy) = self.register(token, easy, Arc::clone(&target)) {
                deliveries.push(Delivery {
                    target,
                    code: Code::Internal(Internal::RestartFailed),
                    easy,
                });
            }
        }
    }

    /// Detach everything still registered, completing it as stopped.
    pub(crate) fn shutdown(mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let stopped = Code::Internal(Internal::EngineStopped);

        for (_, Transfer { handle, target }) in self.transfers.drain() {
            let easy = self.multi.remove2(handle).ok();
            deliveries.push(Delivery {
                target,
                code: stopped,
                easy,
            });
        }
        for Retry { easy, target, .. } in self.retries.drain(..) {
            deliveries.push(Delivery {
                target,
                code: stopped,
                easy: Some(easy),
            });
        }

        self.stats.record(0);
        deliveries
    }
}

fn socket_changed(
    registry: &Registry,
    sockets: &Mutex<HashMap<Socket, Interest>>,
    socket: Socket,
    events: SocketEvents,
) {
    let mut table = sockets.lock();
    let mut source = SourceFd(&socket);

    if events.remove() {
        if table.remove(&socket).is_some() {
            // libcurl may already have closed the descriptor.
            let _ = registry.deregister(&mut source);
        }
        return;
    }

    let interest = if events.input_and_output() {
        Interest::READABLE | Interest::WRITABLE
    } else if events.output() {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    let token = Token(socket as usize);

    let result = if table.insert(socket, interest).is_some() {
        registry.reregister(&mut source, token, interest)
    } else {
        match registry.register(&mut source, token, interest) {
            // A recycled descriptor number that was never deregistered.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(&mut source, token, interest)
            }
            other => other,
        }
    };

    if let Err(err) = result {
        warn!(socket, %err, "failed to watch socket");
    }
}
