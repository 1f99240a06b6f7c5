//! Completion handles
//!
//! A request's result travels from the worker that executes it back to the
//! caller over a `tokio` oneshot channel:
//!
//! ```text
//!   worker thread                      caller
//!   ┌──────────────┐   resolve once   ┌────────────────┐
//!   │  Promise<T>  │ ───────────────► │ Completion<T>  │  .await / wait()
//!   └──────────────┘                  └────────────────┘
//! ```
//!
//! A `Promise` dropped without being resolved closes the channel, which the
//! `Completion` reports as `EpochError::Abandoned`, so every handed-out
//! `Completion` finishes exactly once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{EpochError, Result};

/// Producer half of a completion: resolved exactly once by a worker
#[derive(Debug)]
pub struct Promise<T> {
    sender: oneshot::Sender<Result<T>>,
}

/// Consumer half of a completion: awaited (or waited on) by the caller
#[derive(Debug)]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,

    /// Outcome received by `is_ready` but not yet handed out
    received: Option<Result<T>>,
}

// `received` is never pinned
impl<T> Unpin for Completion<T> {}

/// Create a connected promise/completion pair
pub fn pair<T>() -> (Promise<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        Promise { sender },
        Completion {
            receiver,
            received: None,
        },
    )
}

impl<T> Promise<T> {
    /// Resolve with the given outcome
    pub fn resolve(self, result: Result<T>) {
        // the caller may have dropped its completion
        let _ = self.sender.send(result);
    }

    /// Resolve successfully
    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Resolve with a failure
    pub fn fail(self, err: EpochError) {
        self.resolve(Err(err));
    }
}

impl<T> Completion<T> {
    /// A completion that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        let (promise, completion) = pair();
        promise.resolve(result);
        completion
    }

    /// Whether the outcome is available without blocking
    pub fn is_ready(&mut self) -> bool {
        if self.received.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.received = Some(result);
                true
            }
            Err(TryRecvError::Closed) => {
                self.received = Some(Err(EpochError::Abandoned));
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Block the current thread until the outcome is available.
    ///
    /// Must not be called from inside an async runtime; `.await` instead.
    pub fn wait(self) -> Result<T> {
        let Completion { receiver, received } = self;
        match received {
            Some(result) => result,
            None => receiver
                .blocking_recv()
                .unwrap_or(Err(EpochError::Abandoned)),
        }
    }

    /// Block up to `timeout`; `None` means the outcome is not available yet.
    ///
    /// Once this has returned `Some`, the completion is spent.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        if let Some(result) = self.received.take() {
            return Some(result);
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return Some(Err(EpochError::Io(e))),
        };

        let receiver = &mut self.receiver;
        match runtime.block_on(async { tokio::time::timeout(timeout, receiver).await }) {
            Ok(received) => Some(received.unwrap_or(Err(EpochError::Abandoned))),
            Err(_elapsed) => None,
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.received.take() {
            return Poll::Ready(result);
        }

        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(EpochError::Abandoned)))
    }
}
