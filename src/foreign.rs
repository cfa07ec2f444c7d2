//! Bridging completion handles from outside this crate into promises.
//!
//! A [`ForeignPromise`] is anything that can report a single completion
//! outcome through a callback; [`Classify`] decides whether that outcome is
//! success-shaped or failure-shaped. Plain `std` futures are adapted with
//! [`Driven`], which polls them on the background lane.

use crate::{
    context::{executor, Lane},
    Error, Failure, Resolution,
};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
    task::{waker, ArcWake},
};
use parking_lot::Mutex;
use std::{
    any::Any,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    task::{Context as TaskContext, Poll},
};

/// A type-erased value, as produced by [`Promise::as_any`](crate::Promise::as_any).
pub type DynValue = Arc<dyn Any + Send + Sync>;

/// A completion callback handed to a foreign handle.
pub type Completion<O> = Box<dyn FnOnce(O) + Send + 'static>;

/// A promise-like handle that completes exactly once.
pub trait ForeignPromise: Send + 'static {
    type Outcome: Classify;

    fn on_complete(self, callback: Completion<Self::Outcome>);
}

/// Sorts a foreign outcome into fulfilled or rejected.
pub trait Classify: Send + 'static {
    type Value;

    fn classify(self) -> Resolution<Self::Value>;
}

impl<T, E> Classify for Result<T, E>
where
    T: Send + 'static,
    E: Into<Failure> + Send + 'static,
{
    type Value = T;

    fn classify(self) -> Resolution<T> {
        self.into()
    }
}

impl Classify for DynValue {
    type Value = DynValue;

    /// A [`Failure`] or an [`Error`] is failure-shaped; anything else is a value.
    fn classify(self) -> Resolution<DynValue> {
        if let Some(failure) = self.downcast_ref::<Failure>() {
            Resolution::Rejected(failure.clone())
        } else if let Some(error) = self.downcast_ref::<Error>() {
            Resolution::Rejected(Error::Foreign(error.to_string()).into())
        } else {
            Resolution::Fulfilled(self)
        }
    }
}

impl From<oneshot::Canceled> for Failure {
    fn from(_: oneshot::Canceled) -> Self {
        Failure::cancelled()
    }
}

impl<O: Send + 'static> ForeignPromise for oneshot::Receiver<O> {
    type Outcome = Result<O, oneshot::Canceled>;

    fn on_complete(self, callback: Completion<Self::Outcome>) {
        drive(self.map(callback));
    }
}

/// Adapts a `std` future into a [`ForeignPromise`].
#[derive(Debug)]
pub struct Driven<F>(pub F);

impl<F> ForeignPromise for Driven<F>
where
    F: Future + Send + 'static,
    F::Output: Classify,
{
    type Outcome = F::Output;

    fn on_complete(self, callback: Completion<Self::Outcome>) {
        drive(self.0.map(callback));
    }
}

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

/// A future polled on the background lane whenever it is woken.
struct Task {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    state: AtomicU8,
}

impl Task {
    fn schedule(self: Arc<Self>) {
        executor().schedule(Lane::Background, Box::new(move || self.run()));
    }

    fn run(self: Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);
        let task_waker = waker(self.clone());
        let mut cx = TaskContext::from_waker(&task_waker);
        let mut slot = self.future.lock();
        loop {
            let Some(future) = slot.as_mut() else {
                self.state.store(COMPLETE, Ordering::Release);
                return;
            };
            let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
            match polled {
                Ok(Poll::Pending) => {}
                Ok(Poll::Ready(())) => {
                    *slot = None;
                    self.state.store(COMPLETE, Ordering::Release);
                    return;
                }
                Err(payload) => {
                    tracing::warn!(panic = %Failure::from_panic(payload), "foreign future panicked while polled");
                    *slot = None;
                    self.state.store(COMPLETE, Ordering::Release);
                    return;
                }
            }
            // A wake that arrived while polling asks for another round.
            if self.state.compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return;
            }
            self.state.store(RUNNING, Ordering::Release);
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut current = arc_self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match arc_self.state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if next == SCHEDULED {
                        arc_self.clone().schedule();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

fn drive(future: impl Future<Output = ()> + Send + 'static) {
    let task = Arc::new(Task { future: Mutex::new(Some(future.boxed())), state: AtomicU8::new(SCHEDULED) });
    task.schedule();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc::channel, time::Duration};

    #[test]
    fn test_classify_result() {
        assert_eq!(Ok::<u8, Failure>(3).classify(), Resolution::Fulfilled(3));
        assert!(Err::<u8, _>("nope").classify().is_rejected());
    }

    #[test]
    fn test_classify_dyn_value() {
        let failure = Failure::from("foreign");
        let shaped: DynValue = Arc::new(failure.clone());
        assert_eq!(shaped.classify().failure(), Some(&failure));

        let error: DynValue = Arc::new(Error::Message("bad".into()));
        let rejected = error.classify();
        assert!(matches!(rejected.failure().and_then(Failure::downcast_ref::<Error>), Some(Error::Foreign(_))));

        let value: DynValue = Arc::new(5u32);
        let fulfilled = value.classify();
        assert_eq!(fulfilled.value().and_then(|v| v.downcast_ref::<u32>()), Some(&5));
    }

    #[test]
    fn test_oneshot_completion() {
        let (sender, receiver) = oneshot::channel::<u8>();
        let (tx, rx) = channel();
        receiver.on_complete(Box::new(move |outcome| tx.send(outcome.classify()).unwrap()));
        sender.send(11).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Resolution::Fulfilled(11));
    }

    #[test]
    fn test_dropped_oneshot_is_cancellation() {
        let (sender, receiver) = oneshot::channel::<u8>();
        let (tx, rx) = channel();
        receiver.on_complete(Box::new(move |outcome| tx.send(outcome.classify()).unwrap()));
        drop(sender);
        let resolution = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(resolution.failure().is_some_and(Failure::is_cancelled));
    }

    #[test]
    fn test_driven_ready_future() {
        let (tx, rx) = channel();
        Driven(futures::future::ready(Ok::<_, Failure>("ready")))
            .on_complete(Box::new(move |outcome| tx.send(outcome.classify()).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Resolution::Fulfilled("ready"));
    }
}
