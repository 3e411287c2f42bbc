//! Cooperative coroutine adapter.
//!
//! A [`Coroutine`] owns a protocol future and is resumed by a tick loop
//! instead of an executor. Each [`resume`](Coroutine::resume) polls the
//! future exactly once with a no-op waker; futures waiting on a
//! [`TickPacer`](crate::pacing::TickPacer) become ready once the owner has
//! ticked the pacer far enough.
//!
//! ```text
//! every tick:  pacer.tick()  ──▶  coroutine.resume()  ──▶  Some(output) | None
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A future resumed once per tick by its owner.
///
/// Dropping an unfinished coroutine drops the future and everything it
/// holds, including in-flight guard tickets.
pub struct Coroutine<T> {
    future: Option<BoxedFuture<T>>,
}

impl<T> Coroutine<T> {
    /// Wrap `future`. Nothing runs until the first [`resume`](Self::resume).
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            future: Some(Box::pin(future)),
        }
    }

    /// Advance the coroutine by one poll.
    ///
    /// Returns the output the first time the future completes and `None`
    /// otherwise, including on every resume after completion.
    pub fn resume(&mut self) -> Option<T> {
        let future = self.future.as_mut()?;
        let mut cx = Context::from_waker(noop_waker_ref());
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => {
                self.future = None;
                Some(output)
            }
            Poll::Pending => None,
        }
    }

    /// Whether the coroutine has produced its output.
    pub fn is_finished(&self) -> bool {
        self.future.is_none()
    }
}

impl<T> fmt::Debug for Coroutine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("finished", &self.is_finished())
            .finish()
    }
}
