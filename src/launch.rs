//! Futures over completion callbacks
//!
//! [`Handle::launch`] starts a transfer and returns a [`ResponseFuture`].
//! The future is **runtime-agnostic**: once the handle is idle again the
//! outcome is pushed into a crossfire channel, waking whatever task last
//! polled.

use crate::code::Code;
use crate::wrapper::{Handle, Protocol};
use crossfire::mpsc;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

type OutcomeSender<R> = crossfire::MTx<mpsc::List<Outcome<R>>>;
type OutcomeReceiver<R> = crossfire::Rx<mpsc::List<Outcome<R>>>;

/// A settled transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<R> {
    pub code: Code,
    pub response: R,
}

/// Waker slot shared between the future and the completion callback.
#[derive(Default)]
struct Signal {
    waker: Mutex<Option<Waker>>,
}

impl Signal {
    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }

    fn set_waker(&self, waker: &Waker) {
        let mut guard = self.waker.lock();
        match guard.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *guard = Some(waker.clone()),
        }
    }
}

/// Sending half, moved into the completion callback.
struct Completer<R: 'static> {
    signal: Arc<Signal>,
    sender: Option<OutcomeSender<R>>,
}

impl<R: 'static> Completer<R> {
    fn complete(mut self, outcome: Outcome<R>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(outcome);
        }
    }
}

impl<R: 'static> Drop for Completer<R> {
    fn drop(&mut self) {
        // Disconnect before waking so a poll sees either the outcome or the
        // closed channel.
        self.sender.take();
        self.signal.wake();
    }
}

/// Resolves to the outcome of a launched transfer, or `None` when the handle
/// was busy and nothing was started.
pub struct ResponseFuture<R: 'static> {
    signal: Arc<Signal>,
    receiver: OutcomeReceiver<R>,
}

impl<R: 'static> Unpin for ResponseFuture<R> {}

impl<R: 'static> ResponseFuture<R> {
    fn channel() -> (Self, Completer<R>) {
        let (sender, receiver) = mpsc::unbounded_blocking();
        let signal = Arc::new(Signal::default());
        let completer = Completer {
            signal: Arc::clone(&signal),
            sender: Some(sender),
        };
        (Self { signal, receiver }, completer)
    }

    /// Block the current thread until the transfer settles.
    pub fn wait(self) -> Option<Outcome<R>> {
        self.receiver.recv().ok()
    }
}

impl<R: 'static> Future for ResponseFuture<R> {
    type Output = Option<Outcome<R>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.signal.set_waker(cx.waker());
        match this.receiver.try_recv() {
            Ok(outcome) => Poll::Ready(Some(outcome)),
            Err(crossfire::TryRecvError::Empty) => Poll::Pending,
            Err(crossfire::TryRecvError::Disconnected) => Poll::Ready(None),
        }
    }
}

impl<P: Protocol> Handle<P> {
    /// Start the transfer and return a future for its outcome.
    ///
    /// The future resolves once the handle is idle again, so it can be
    /// reused right away. This start delivers on the loop thread whatever
    /// [`threaded_callback`](Handle::threaded_callback) says; the callback
    /// only moves the response out.
    pub fn launch(&self) -> ResponseFuture<P::Response> {
        let (future, completer) = ResponseFuture::channel();
        let slot = Arc::new(Mutex::new(None));

        let harvest = Arc::clone(&slot);
        let callback = Box::new(move |handle: &Handle<P>| {
            let code = handle.code();
            *harvest.lock() = handle
                .take_response()
                .map(|response| Outcome { code, response });
        });
        let settled = Box::new(move || {
            if let Some(outcome) = slot.lock().take() {
                completer.complete(outcome);
            }
        });

        self.start_settled(callback, settled);
        future
    }
}
