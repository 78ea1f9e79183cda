//! The transfer engine
//!
//! An [`Engine`] owns one event loop thread that drives every transfer
//! through a single libcurl multi handle, one delivery thread for completion
//! callbacks that should not run on the loop, the shared DNS/TLS/connection
//! cache, and the process-wide defaults copied into each new handle.
//!
//! ```no_run
//! use curlev::{Engine, Http};
//!
//! let engine = Engine::new();
//! engine.start()?;
//! engine.options("timeout=5000,follow_location=1")?;
//!
//! let http = Http::create(&engine)?;
//! http.get("https://example.com/").exec();
//! println!("{} {}", http.code(), http.text());
//!
//! engine.stop(std::time::Duration::from_secs(5));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::authentication::Authentication;
use crate::certificates::Certificates;
use crate::error::{ConfigError, Error};
use crate::options::Options;
use crate::reactor::{Delivery, Reactor, Stats};
use crate::share::Share;
use crate::sink::Sink;
use crate::types::{CURLINFO_CAINFO, CURLINFO_CAPATH, CURLOPT_SHARE, cvt, getinfo_str, setopt_ptr};
use crate::wrapper::Completion;
use crossfire::mpsc;
use curl::easy::Easy2;
use mio::Waker;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

type DeliverySender = crossfire::MTx<mpsc::List<Delivery>>;
type DeliveryReceiver = crossfire::Rx<mpsc::List<Delivery>>;

const LOOP_THREAD: &str = "curlev-loop";
const DELIVERY_THREAD: &str = "curlev-callback";

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Drain timeout used when the engine is dropped.
    pub stop_timeout: Duration,
    /// Upper bound on any single wait of the loop thread.
    pub event_wait_timeout: Duration,
    /// Polling interval while [`Engine::stop`] waits for in-flight work.
    pub short_wait: Duration,
    /// Transfers the multiplexer is assumed to accept per millisecond. The
    /// loop sleeps `waiting / registrations_per_ms` milliseconds to let a
    /// backlog of registrations through.
    pub registrations_per_ms: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            event_wait_timeout: Duration::from_secs(1),
            short_wait: Duration::from_millis(10),
            registrations_per_ms: 300,
        }
    }
}

/// Configuration every new handle starts from.
#[derive(Debug, Clone, Default)]
pub(crate) struct Defaults {
    pub(crate) options: Options,
    pub(crate) authentication: Authentication,
    pub(crate) certificates: Certificates,
}

struct Global {
    users: usize,
    ca_info: String,
    ca_path: String,
}

static GLOBAL: Mutex<Global> = Mutex::new(Global {
    users: 0,
    ca_info: String::new(),
    ca_path: String::new(),
});

/// Take a reference on libcurl's global state, returning the default
/// trust-store paths captured when it was first initialized.
fn global_acquire() -> Result<(String, String), Error> {
    let mut global = GLOBAL.lock();
    if global.users == 0 {
        cvt(unsafe { curl_sys::curl_global_init(curl_sys::CURL_GLOBAL_ALL) })
            .map_err(Error::GlobalInit)?;
        let scratch = curl::easy::Easy::new();
        global.ca_info = getinfo_str(scratch.raw(), CURLINFO_CAINFO);
        global.ca_path = getinfo_str(scratch.raw(), CURLINFO_CAPATH);
        debug!(ca_info = %global.ca_info, ca_path = %global.ca_path, "libcurl initialized");
    }
    global.users += 1;
    Ok((global.ca_info.clone(), global.ca_path.clone()))
}

fn global_release() {
    let mut global = GLOBAL.lock();
    global.users = global.users.saturating_sub(1);
    if global.users == 0 {
        unsafe { curl_sys::curl_global_cleanup() };
        debug!("libcurl cleaned up");
    }
}

/// State shared by the engine, its threads and every handle created from it.
pub(crate) struct Core {
    config: EngineConfig,
    // The loop mutex. Holding it is the only way to touch the multiplexer.
    reactor: Mutex<Option<Reactor>>,
    wakeup: Condvar,
    waker: Mutex<Option<Arc<Waker>>>,
    running: AtomicBool,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    next_token: AtomicUsize,
    crashed: AtomicBool,
    stats: Arc<Stats>,
    share: Mutex<Option<Arc<Share>>>,
    delivery: Mutex<Option<DeliverySender>>,
    defaults: RwLock<Defaults>,
}

impl Core {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            reactor: Mutex::new(None),
            wakeup: Condvar::new(),
            waker: Mutex::new(None),
            running: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            next_token: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            stats: Arc::default(),
            share: Mutex::new(None),
            delivery: Mutex::new(None),
            defaults: RwLock::new(Defaults::default()),
        }
    }

    /// Acquire the loop mutex, interrupting a blocked poll first.
    fn lock_reactor(&self) -> MutexGuard<'_, Option<Reactor>> {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(err) = waker.wake() {
                warn!(%err, "failed to wake event loop");
            }
        }
        let guard = self.reactor.lock();
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        guard
    }

    pub(crate) fn reserve_token(&self) -> usize {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A fresh easy handle wired to this engine's shared cache.
    pub(crate) fn new_easy(&self) -> Result<Easy2<Sink>, curl::Error> {
        let share = self.share.lock().clone();
        let raw_share = share.as_ref().map(|share| share.as_raw());
        let mut easy = Easy2::new(Sink::new(share));
        easy.signal(false)?;
        if let Some(raw_share) = raw_share {
            setopt_ptr(&mut easy, CURLOPT_SHARE, raw_share.cast())?;
        }
        Ok(easy)
    }

    pub(crate) fn defaults(&self) -> Defaults {
        self.defaults.read().clone()
    }

    pub(crate) fn report_crash(&self) {
        self.crashed.store(true, Ordering::Release);
    }

    /// Register a transfer with the multiplexer.
    ///
    /// On failure no completion will ever be delivered for `token`; the easy
    /// handle is returned when the multiplexer gave it back.
    pub(crate) fn start_request(
        &self,
        token: usize,
        easy: Easy2<Sink>,
        target: Arc<dyn Completion>,
    ) -> Result<(), Option<Easy2<Sink>>> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let registered = match self.lock_reactor().as_mut() {
            Some(reactor) => reactor.register(token, easy, target),
            None => Err(Some(easy)),
        };

        match registered {
            Ok(()) => {
                self.wakeup.notify_one();
                trace!(token, "transfer registered");
                Ok(())
            }
            Err(easy) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                warn!(token, "transfer could not be registered");
                Err(easy)
            }
        }
    }

    /// Abort a registered or retry-pending transfer. Returns whether there
    /// was anything to abort.
    pub(crate) fn abort_request(&self, token: usize) -> bool {
        let aborted = self
            .lock_reactor()
            .as_mut()
            .and_then(|reactor| reactor.unregister(token));

        match aborted {
            Some(delivery) => {
                trace!(token, "transfer aborted");
                self.deliver(delivery);
                true
            }
            None => false,
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let delivery = if delivery.target.use_threaded_cb() {
            match self.delivery.lock().as_ref() {
                Some(sender) => match sender.send(delivery) {
                    Ok(()) => return,
                    Err(crossfire::SendError(returned)) => returned,
                },
                None => delivery,
            }
        } else {
            delivery
        };
        self.invoke(delivery);
    }

    fn invoke(&self, delivery: Delivery) {
        let Delivery { target, code, easy } = delivery;
        let result = panic::catch_unwind(AssertUnwindSafe(|| target.async_cb(code, easy)));
        if result.is_err() {
            error!(%code, "transfer completion panicked");
            self.report_crash();
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        // Possibly the last reference to the handle.
        drop(target);
    }

    fn run_loop(&self) {
        debug!("event loop running");
        let registrations_per_ms = u64::from(self.config.registrations_per_ms.max(1));
        let mut deliveries = Vec::new();
        let mut guard = self.reactor.lock();

        while self.running.load(Ordering::Acquire) {
            let active = guard
                .as_mut()
                .is_some_and(|reactor| reactor.run_once(&mut deliveries));

            if !deliveries.is_empty() {
                MutexGuard::unlocked(&mut guard, || {
                    for delivery in deliveries.drain(..) {
                        self.deliver(delivery);
                    }
                });
                continue;
            }

            let waiting = self.waiting.load(Ordering::Acquire) as u64;
            if active {
                if waiting > 0 {
                    let backlog = Duration::from_micros(waiting * 1000 / registrations_per_ms);
                    MutexGuard::unlocked_fair(&mut guard, || thread::sleep(backlog));
                }
            } else if waiting > 0 {
                MutexGuard::bump(&mut guard);
            } else {
                self.wakeup
                    .wait_for(&mut guard, self.config.event_wait_timeout);
            }
        }
        debug!("event loop stopped");
    }

    fn run_delivery(&self, receiver: DeliveryReceiver) {
        debug!("delivery thread running");
        while let Ok(delivery) = receiver.recv() {
            self.invoke(delivery);
        }
        debug!("delivery thread stopped");
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.config.short_wait.min(deadline - now));
        }
    }

    fn reset_defaults(&self, ca_info: &str, ca_path: &str) {
        *self.defaults.write() = Defaults {
            certificates: Certificates::with_default_ca(ca_info, ca_path),
            ..Defaults::default()
        };
    }
}

#[derive(Default)]
struct Threads {
    event_loop: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    global: bool,
}

/// Owner of the event loop, the delivery thread and the shared cache.
///
/// Dropping the engine stops it with [`EngineConfig::stop_timeout`]. Handles
/// keep working as plain values after the engine stops, but every start
/// fails with [`Internal::Start`](crate::Internal::Start) until it is
/// started again.
pub struct Engine {
    core: Arc<Core>,
    threads: Mutex<Threads>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            core: Arc::new(Core::new(config)),
            threads: Mutex::new(Threads::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Bring the engine up. Calling it on a running engine does nothing.
    ///
    /// Resets the process-wide defaults. A failed start releases whatever it
    /// had already set up.
    pub fn start(&self) -> Result<(), Error> {
        let mut threads = self.threads.lock();
        if self.core.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let result = self.bring_up(&mut threads);
        if let Err(err) = &result {
            warn!(%err, "engine failed to start");
            self.tear_down(&mut threads);
        }
        result
    }

    fn bring_up(&self, threads: &mut Threads) -> Result<(), Error> {
        let (ca_info, ca_path) = global_acquire()?;
        threads.global = true;

        *self.core.share.lock() = Some(Arc::new(Share::new()?));

        let reactor = Reactor::new(
            Arc::clone(&self.core.stats),
            self.core.config.event_wait_timeout,
        )?;
        *self.core.waker.lock() = Some(reactor.waker());
        *self.core.reactor.lock() = Some(reactor);

        self.core.running.store(true, Ordering::Release);
        let core = Arc::clone(&self.core);
        let event_loop = thread::Builder::new()
            .name(LOOP_THREAD.to_string())
            .spawn(move || core.run_loop())
            .map_err(|source| Error::Thread {
                name: LOOP_THREAD,
                source,
            })?;
        threads.event_loop = Some(event_loop);

        let (sender, receiver) = mpsc::unbounded_blocking();
        *self.core.delivery.lock() = Some(sender);
        let core = Arc::clone(&self.core);
        let delivery = thread::Builder::new()
            .name(DELIVERY_THREAD.to_string())
            .spawn(move || core.run_delivery(receiver))
            .map_err(|source| Error::Thread {
                name: DELIVERY_THREAD,
                source,
            })?;
        threads.delivery = Some(delivery);

        self.core.reset_defaults(&ca_info, &ca_path);
        debug!("engine started");
        Ok(())
    }

    /// Wait up to `timeout` for in-flight transfers, then tear down.
    ///
    /// Returns `true` when the wait gave up and teardown was forced. Any
    /// transfer still registered at that point completes with
    /// [`Internal::EngineStopped`](crate::Internal::EngineStopped).
    ///
    /// Must not be called from a completion callback.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut threads = self.threads.lock();
        let drained = self.core.wait_idle(timeout);
        if !drained {
            warn!(
                in_flight = self.core.in_flight.load(Ordering::Acquire),
                "forcing engine stop"
            );
        }
        self.tear_down(&mut threads);
        !drained
    }

    fn tear_down(&self, threads: &mut Threads) {
        {
            let _reactor = self.core.lock_reactor();
            self.core.running.store(false, Ordering::Release);
            self.core.wakeup.notify_all();
        }
        if let Some(event_loop) = threads.event_loop.take() {
            if event_loop.join().is_err() {
                error!("event loop thread panicked");
            }
        }
        self.core.waker.lock().take();

        let leftover = self.core.reactor.lock().take().map(Reactor::shutdown);
        for delivery in leftover.into_iter().flatten() {
            self.core.invoke(delivery);
        }

        self.core.delivery.lock().take();
        if let Some(delivery) = threads.delivery.take() {
            if delivery.join().is_err() {
                error!("delivery thread panicked");
            }
        }

        self.core.share.lock().take();
        if std::mem::take(&mut threads.global) {
            global_release();
            debug!("engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Merge `cskv` into the default [`Options`].
    pub fn options(&self, cskv: &str) -> Result<(), ConfigError> {
        self.core.defaults.write().options.set(cskv)
    }

    /// Merge `cskv` into the default [`Authentication`].
    pub fn authentication(&self, cskv: &str) -> Result<(), ConfigError> {
        self.core.defaults.write().authentication.set(cskv)
    }

    /// Merge `cskv` into the default [`Certificates`].
    pub fn certificates(&self, cskv: &str) -> Result<(), ConfigError> {
        self.core.defaults.write().certificates.set(cskv)
    }

    pub fn default_options(&self) -> Options {
        self.core.defaults.read().options.clone()
    }

    pub fn default_authentication(&self) -> Authentication {
        self.core.defaults.read().authentication.clone()
    }

    pub fn default_certificates(&self) -> Certificates {
        self.core.defaults.read().certificates.clone()
    }

    /// Most transfers ever registered with the multiplexer at once.
    pub fn peak_requests(&self) -> usize {
        self.core.stats.peak()
    }

    /// Transfers registered with the multiplexer right now.
    pub fn active_requests(&self) -> usize {
        self.core.stats.current()
    }

    /// Whether any completion callback has panicked. Sticky.
    pub fn protocol_crashed(&self) -> bool {
        self.core.crashed.load(Ordering::Acquire)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop(self.core.config.stop_timeout);
    }
}
