//! Protocol-agnostic transfer handle
//!
//! A [`Handle`] binds one libcurl easy handle to one [`Protocol`] and runs
//! it through `idle -> running -> finished -> idle`. Setters only take effect
//! while idle, so nothing the loop thread may be reading is mutated
//! underneath it.

use crate::authentication::Authentication;
use crate::certificates::Certificates;
use crate::code::{Code, Internal};
use crate::engine::{Core, Defaults, Engine};
use crate::error::Error;
use crate::options::Options;
use crate::sink::{DEFAULT_MAX_RESPONSE_SIZE, Sink};
use curl::easy::Easy2;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, trace, warn};

/// Protocol-specific request filling and response harvesting.
pub trait Protocol: Default + Send + 'static {
    /// What [`Handle::launch`] resolves to.
    type Response: Send + 'static;

    /// Fill protocol fields into `easy` just before the transfer starts.
    fn prepare_protocol(&mut self, easy: &mut Easy2<Sink>, options: &Options) -> Result<(), Code>;

    /// Harvest response fields once the transfer has settled.
    fn finalize_protocol(&mut self, easy: &mut Easy2<Sink>);

    /// Forget request and response state.
    fn clear_protocol(&mut self);

    /// Whether a protocol status code may be retried.
    fn retries_on_status(&self, _status: u32) -> bool {
        false
    }

    /// Move the harvested response out.
    fn take_response(&mut self) -> Self::Response;
}

/// What the engine needs from a transfer it completes.
pub(crate) trait Completion: Send + Sync {
    /// Settle the transfer. `easy` is the handle libcurl gave back, if any.
    fn async_cb(&self, code: Code, easy: Option<Easy2<Sink>>);
    /// Consume one retry attempt if any are left.
    fn can_reattempt(&self) -> bool;
    fn retry_delay(&self) -> Duration;
    fn use_threaded_cb(&self) -> bool;
    fn retries_on_status(&self, status: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Finished,
}

pub(crate) type Callback<P> = Box<dyn FnOnce(&Handle<P>) + Send>;
/// Runs once the handle is idle again after a start.
pub(crate) type Settled = Box<dyn FnOnce() + Send>;

pub(crate) struct Inner<P: Protocol> {
    state: State,
    code: Code,
    // First setter failure since the last clear; blocks every start.
    rejected: Option<Internal>,
    easy: Option<Easy2<Sink>>,
    token: Option<usize>,
    // Set by `abort` while running; re-checked once registration is done.
    abort_requested: bool,
    options: Options,
    authentication: Authentication,
    certificates: Certificates,
    max_retries: u32,
    retry_delay: Duration,
    attempts: u32,
    threaded: bool,
    // Loop-thread delivery for the current start only.
    on_loop: bool,
    max_response_size: usize,
    callback: Option<Callback<P>>,
    settled: Option<Settled>,
    pub(crate) protocol: P,
}

impl<P: Protocol> Inner<P> {
    fn new(easy: Easy2<Sink>, defaults: Defaults) -> Self {
        Self {
            state: State::Idle,
            code: Code::Success,
            rejected: None,
            easy: Some(easy),
            token: None,
            abort_requested: false,
            options: defaults.options,
            authentication: defaults.authentication,
            certificates: defaults.certificates,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            attempts: 0,
            threaded: true,
            on_loop: false,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            callback: None,
            settled: None,
            protocol: P::default(),
        }
    }

    fn clear(&mut self, defaults: Defaults) {
        self.code = Code::Success;
        self.rejected = None;
        self.options = defaults.options;
        self.authentication = defaults.authentication;
        self.certificates = defaults.certificates;
        self.protocol.clear_protocol();
    }

    /// Record a setter failure. The first one sticks until `clear`.
    pub(crate) fn reject(&mut self, internal: Internal) {
        let rejected = *self.rejected.get_or_insert(internal);
        self.code = rejected.into();
    }

    fn prepare(&mut self) -> Result<Easy2<Sink>, Code> {
        if let Some(rejected) = self.rejected {
            return Err(rejected.into());
        }
        let mut easy = self.easy.take().ok_or(Code::Internal(Internal::NoHandle))?;
        match self.prepare_easy(&mut easy) {
            Ok(()) => Ok(easy),
            Err(code) => {
                self.easy = Some(easy);
                Err(code)
            }
        }
    }

    fn prepare_easy(&mut self, easy: &mut Easy2<Sink>) -> Result<(), Code> {
        let sink = easy.get_mut();
        sink.reset_response();
        sink.set_max_response_size(self.max_response_size);

        self.protocol.prepare_protocol(easy, &self.options)?;
        self.options.apply(easy).map_err(|err| {
            warn!(%err, "failed to apply options");
            Internal::Options
        })?;
        self.authentication.apply(easy).map_err(|err| {
            warn!(%err, "failed to apply authentication");
            Internal::Authentication
        })?;
        self.certificates.apply(easy).map_err(|err| {
            warn!(%err, "failed to apply certificates");
            Internal::Certificates
        })?;
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(easy) = self.easy.as_mut() {
            self.protocol.finalize_protocol(easy);
        }
    }
}

/// A reusable transfer bound to one engine.
///
/// Always held in an [`Arc`]: while a transfer is in flight the engine holds
/// a second reference, so dropping yours never cancels or frees a running
/// transfer. Use [`Handle::abort`] to cancel.
pub struct Handle<P: Protocol> {
    core: Arc<Core>,
    this: Weak<Self>,
    inner: Mutex<Inner<P>>,
    changed: Condvar,
}

impl<P: Protocol> Handle<P> {
    /// Create a handle whose configuration starts from the engine defaults.
    pub fn create(engine: &Engine) -> Result<Arc<Self>, Error> {
        let core = Arc::clone(engine.core());
        let easy = core.new_easy().map_err(Error::EasyAlloc)?;
        let inner = Inner::new(easy, core.defaults());
        Ok(Arc::new_cyclic(|this| Self {
            core,
            this: Weak::clone(this),
            inner: Mutex::new(inner),
            changed: Condvar::new(),
        }))
    }

    /// Run `action` only while idle. Returns whether it ran.
    pub(crate) fn do_if_idle<F>(&self, action: F) -> bool
    where
        F: FnOnce(&mut Inner<P>),
    {
        let mut inner = self.inner.lock();
        if inner.state != State::Idle {
            return false;
        }
        action(&mut inner);
        true
    }

    /// Read protocol state when no transfer is running.
    pub(crate) fn read_protocol<R>(&self, read: impl FnOnce(&P) -> R) -> Option<R> {
        let inner = self.inner.lock();
        (inner.state != State::Running).then(|| read(&inner.protocol))
    }

    /// Reset request and response state and reload the engine defaults.
    pub fn clear(&self) -> &Self {
        let defaults = self.core.defaults();
        self.do_if_idle(|inner| inner.clear(defaults));
        self
    }

    pub fn options(&self, cskv: &str) -> &Self {
        self.do_if_idle(|inner| {
            if let Err(err) = inner.options.set(cskv) {
                warn!(%err, "rejected options");
                inner.reject(Internal::Options);
            }
        });
        self
    }

    pub fn authentication(&self, cskv: &str) -> &Self {
        self.do_if_idle(|inner| {
            if let Err(err) = inner.authentication.set(cskv) {
                warn!(%err, "rejected authentication");
                inner.reject(Internal::Authentication);
            }
        });
        self
    }

    pub fn certificates(&self, cskv: &str) -> &Self {
        self.do_if_idle(|inner| {
            if let Err(err) = inner.certificates.set(cskv) {
                warn!(%err, "rejected certificates");
                inner.reject(Internal::Certificates);
            }
        });
        self
    }

    /// Deliver completion callbacks on the engine's delivery thread (the
    /// default) or directly on the loop thread.
    pub fn threaded_callback(&self, threaded: bool) -> &Self {
        self.do_if_idle(|inner| inner.threaded = threaded);
        self
    }

    /// Retry transient failures up to `max` times, `delay` apart.
    pub fn set_retries(&self, max: u32, delay: Duration) -> &Self {
        self.do_if_idle(|inner| {
            inner.max_retries = max;
            inner.retry_delay = delay;
        });
        self
    }

    /// Fail transfers whose body would grow past `bytes`.
    pub fn max_response_size(&self, bytes: usize) -> &Self {
        self.do_if_idle(|inner| inner.max_response_size = bytes);
        self
    }

    /// Start the transfer without a completion callback.
    pub fn start(&self) -> &Self {
        self.begin(None, None, false)
    }

    /// Start the transfer and call `callback` once it settles.
    ///
    /// Does nothing, and drops `callback`, unless the handle is idle.
    pub fn start_with<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Handle<P>) + Send + 'static,
    {
        self.begin(Some(Box::new(callback)), None, false)
    }

    /// Like [`start_with`](Self::start_with) with loop-thread delivery for
    /// this start only, and `settled` runs once the handle is idle again.
    /// Both are dropped unless the handle is idle.
    pub(crate) fn start_settled(&self, callback: Callback<P>, settled: Settled) -> &Self {
        self.begin(Some(callback), Some(settled), true)
    }

    fn begin(&self, callback: Option<Callback<P>>, settled: Option<Settled>, on_loop: bool) -> &Self {
        let Some(this) = self.this.upgrade() else {
            return self;
        };

        let mut inner = self.inner.lock();
        if inner.state != State::Idle {
            return self;
        }
        inner.callback = callback;
        inner.settled = settled;
        inner.attempts = 0;
        inner.abort_requested = false;
        inner.on_loop = on_loop;

        let easy = match inner.prepare() {
            Ok(easy) => easy,
            Err(code) => {
                trace!(%code, "transfer not started");
                inner.code = code;
                drop(inner);
                self.fail_start();
                return self;
            }
        };

        let token = self.core.reserve_token();
        inner.token = Some(token);
        inner.state = State::Running;
        drop(inner);

        trace!(token, "starting transfer");
        match self.core.start_request(token, easy, this) {
            Ok(()) => self.abort_if_requested(token),
            Err(easy) => {
                let mut inner = self.inner.lock();
                inner.easy = easy.or_else(|| self.core.new_easy().ok());
                inner.code = Internal::Start.into();
                inner.token = None;
                inner.state = State::Idle;
                self.changed.notify_all();
                drop(inner);
                self.fail_start();
            }
        }
        self
    }

    /// An `abort` that landed between `Running` and registration found
    /// nothing to remove; replay it now that `token` is registered.
    fn abort_if_requested(&self, token: usize) {
        let replay = {
            let inner = self.inner.lock();
            inner.abort_requested && inner.state == State::Running && inner.token == Some(token)
        };
        if replay {
            trace!(token, "replaying early abort");
            self.core.abort_request(token);
        }
    }

    fn fail_start(&self) {
        let callback = self.inner.lock().callback.take();
        let crashed = callback.is_some_and(|callback| self.run_callback(callback));
        let settled = {
            let mut inner = self.inner.lock();
            if crashed {
                inner.code = Internal::CallbackCrashed.into();
            }
            inner.settled.take()
        };
        if let Some(settled) = settled {
            settled();
        }
    }

    /// Returns whether the callback panicked.
    fn run_callback(&self, callback: Callback<P>) -> bool {
        let crashed = panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err();
        if crashed {
            error!("completion callback panicked");
            self.core.report_crash();
        }
        crashed
    }

    /// Block until the current transfer, if any, has settled.
    pub fn join(&self) -> &Self {
        let mut inner = self.inner.lock();
        while inner.state == State::Running {
            self.changed.wait(&mut inner);
        }
        self
    }

    /// `start().join()`.
    pub fn exec(&self) -> &Self {
        self.start().join()
    }

    /// Cancel the running transfer. The callback still fires, with
    /// [`Code::ABORTED`].
    pub fn abort(&self) -> &Self {
        let token = {
            let mut inner = self.inner.lock();
            if inner.state != State::Running {
                return self;
            }
            inner.abort_requested = true;
            inner.token
        };
        if let Some(token) = token {
            self.core.abort_request(token);
        }
        self
    }

    /// The settled outcome, or [`Code::Running`] while a transfer runs.
    pub fn code(&self) -> Code {
        let inner = self.inner.lock();
        match inner.state {
            State::Running => Code::Running,
            _ => inner.code,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().state == State::Running
    }

    /// Move the harvested response out of the protocol.
    pub fn take_response(&self) -> Option<P::Response> {
        let mut inner = self.inner.lock();
        (inner.state != State::Running).then(|| inner.protocol.take_response())
    }

    pub(crate) fn with_inner<R>(&self, action: impl FnOnce(&mut Inner<P>) -> R) -> R {
        action(&mut self.inner.lock())
    }
}

impl<P: Protocol> Completion for Handle<P> {
    fn async_cb(&self, code: Code, easy: Option<Easy2<Sink>>) {
        let (callback, mut settled) = {
            let mut inner = self.inner.lock();
            inner.code = code;
            inner.token = None;
            inner.abort_requested = false;
            inner.easy = easy.or_else(|| self.core.new_easy().ok());
            inner.finalize();
            let callback = inner.callback.take();
            let settled = if callback.is_some() {
                inner.state = State::Finished;
                None
            } else {
                inner.state = State::Idle;
                inner.settled.take()
            };
            self.changed.notify_all();
            (callback, settled)
        };

        if let Some(callback) = callback {
            let crashed = self.run_callback(callback);
            let mut inner = self.inner.lock();
            if crashed {
                inner.code = Internal::CallbackCrashed.into();
            }
            inner.state = State::Idle;
            settled = inner.settled.take();
            self.changed.notify_all();
        }

        if let Some(settled) = settled {
            settled();
        }
    }

    fn can_reattempt(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.attempts < inner.max_retries {
            inner.attempts += 1;
            true
        } else {
            false
        }
    }

    fn retry_delay(&self) -> Duration {
        self.inner.lock().retry_delay
    }

    fn use_threaded_cb(&self) -> bool {
        let inner = self.inner.lock();
        inner.threaded && !inner.on_loop && inner.callback.is_some()
    }

    fn retries_on_status(&self, status: u32) -> bool {
        self.inner.lock().protocol.retries_on_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        prepared: usize,
        finalized: usize,
        cleared: usize,
        fail_prepare: bool,
    }

    impl Protocol for Recorder {
        type Response = usize;

        fn prepare_protocol(&mut self, _: &mut Easy2<Sink>, _: &Options) -> Result<(), Code> {
            self.prepared += 1;
            if self.fail_prepare {
                return Err(Internal::Prepare.into());
            }
            Ok(())
        }

        fn finalize_protocol(&mut self, _: &mut Easy2<Sink>) {
            self.finalized += 1;
        }

        fn clear_protocol(&mut self) {
            self.cleared += 1;
        }

        fn take_response(&mut self) -> usize {
            self.finalized
        }
    }

    #[test]
    fn test_setter_error_sticks_until_clear() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        handle.options("nonsense=1");
        assert_eq!(handle.code(), Code::Internal(Internal::Options));
        handle.authentication("mode=mystery");
        assert_eq!(handle.code(), Code::Internal(Internal::Options));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        handle.start_with(move |h| {
            assert_eq!(h.code(), Code::Internal(Internal::Options));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!handle.is_running());
        assert_eq!(handle.with_inner(|inner| inner.protocol.prepared), 0);

        handle.clear();
        assert_eq!(handle.code(), Code::Success);
        assert_eq!(handle.with_inner(|inner| inner.protocol.cleared), 1);
    }

    #[test]
    fn test_prepare_failure_reports_synchronously() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        handle.do_if_idle(|inner| inner.protocol.fail_prepare = true);
        handle.exec();
        assert_eq!(handle.code(), Code::Internal(Internal::Prepare));
        assert!(handle.with_inner(|inner| inner.easy.is_some()));
    }

    #[test]
    fn test_start_on_stopped_engine_fails() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        handle.start_with(move |h| {
            assert_eq!(h.code(), Code::Internal(Internal::Start));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.join();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.code(), Code::Internal(Internal::Start));
        // The easy handle came back and the handle stays usable.
        assert!(handle.with_inner(|inner| inner.easy.is_some()));
        assert!(handle.do_if_idle(|_| {}));
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        handle.start_with(|_| panic!("boom"));
        assert_eq!(handle.code(), Code::Internal(Internal::CallbackCrashed));
        assert!(engine.protocol_crashed());
    }

    #[test]
    fn test_retry_budget() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        handle.set_retries(2, Duration::from_millis(5));
        assert!(handle.can_reattempt());
        assert!(handle.can_reattempt());
        assert!(!handle.can_reattempt());
        assert_eq!(handle.retry_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_threaded_only_with_callback() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        assert!(!handle.use_threaded_cb());
        handle.with_inner(|inner| inner.callback = Some(Box::new(|_: &Handle<Recorder>| {})));
        assert!(handle.use_threaded_cb());
        handle.with_inner(|inner| inner.on_loop = true);
        assert!(!handle.use_threaded_cb());
        handle.with_inner(|inner| inner.on_loop = false);
        handle.threaded_callback(false);
        assert!(!handle.use_threaded_cb());
    }

    #[test]
    fn test_abort_while_idle_is_not_remembered() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        handle.abort();
        assert!(!handle.with_inner(|inner| inner.abort_requested));

        handle.with_inner(|inner| {
            inner.state = State::Running;
            inner.token = Some(7);
        });
        handle.abort();
        assert!(handle.with_inner(|inner| inner.abort_requested));

        let easy = handle.with_inner(|inner| inner.easy.take());
        handle.async_cb(Code::ABORTED, easy);
        assert!(!handle.with_inner(|inner| inner.abort_requested));
    }

    #[test]
    fn test_async_cb_settles_and_returns_easy() {
        let engine = Engine::new();
        let handle = Handle::<Recorder>::create(&engine).expect("handle");
        let easy = handle.with_inner(|inner| {
            inner.state = State::Running;
            inner.easy.take()
        });
        assert_eq!(handle.code(), Code::Running);
        handle.async_cb(Code::Status(204), easy);
        assert_eq!(handle.code(), Code::Status(204));
        assert_eq!(handle.take_response(), Some(1));
    }
}
