//! The chainable promise handle.
//!
//! Every operator allocates a new [`Promise`] whose cell is settled by
//! piping the parent's resolution through a transform. Operators register
//! with the parent and return right away; the transform itself runs on the
//! requested [`Context`].
//!
//! # Examples
//!
//! ```
//! use sealed_promise::Promise;
//! use futures::executor::block_on;
//! use std::thread;
//!
//! let (promise, sealant) = Promise::<u32>::pending();
//! let answer = promise.map(|x| Ok(x + 1));
//! thread::spawn(move || sealant.fulfill(41));
//! assert_eq!(block_on(answer).unwrap(), 42);
//! ```

use crate::{
    cell::SettlementCell,
    context::{dispatch, Context},
    foreign::{Classify, Driven, DynValue, ForeignPromise},
    resolution::contain,
    tracker::UnhandledTracker,
    Error, Failure, Resolution, Value,
};
use futures::channel::oneshot;
use std::{
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

/// Which rejections a [`Promise::report_with`] handler is invoked for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    AllErrors,
    /// Skip cancellation-class failures (they are still marked handled).
    #[default]
    AllErrorsExceptCancellation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

/// Settles `cell`, recording a rejection as unhandled first so that a
/// handler consuming it synchronously finds it in the table.
fn settle<T: Value>(cell: &SettlementCell<T>, resolution: Resolution<T>) -> bool {
    let recorded = match &resolution {
        Resolution::Rejected(failure) => Some((failure.clone(), UnhandledTracker::global().record(failure))),
        Resolution::Fulfilled(_) => None,
    };
    let won = cell.resolve(resolution);
    if let Some((failure, true)) = recorded {
        // A racing attempt may have settled with this very failure; the
        // record then belongs to it.
        let kept = matches!(cell.peek(), Some(Resolution::Rejected(winner)) if winner.same_as(&failure));
        if !won && !kept {
            UnhandledTracker::global().consume(&failure);
        }
    }
    won
}

/// The resolver of a derived promise.
struct Link<T: Value> {
    cell: Arc<SettlementCell<T>>,
}

impl<T: Value> Link<T> {
    /// Settles with an outcome produced at this step of the chain.
    fn settle(&self, resolution: Resolution<T>) {
        settle(&self.cell, resolution);
    }

    /// Passes along an outcome that was already accounted for upstream.
    fn forward(&self, resolution: Resolution<T>) {
        self.cell.resolve(resolution);
    }
}

/// The write side of a pending promise.
///
/// Clones share the same promise; the first resolution wins. Once the last
/// clone is dropped an unresolved promise is rejected with
/// [`Error::SealantDropped`].
pub struct Sealant<T: Value> {
    inner: Arc<SealantInner<T>>,
}

struct SealantInner<T: Value> {
    cell: Arc<SettlementCell<T>>,
}

impl<T: Value> Sealant<T> {
    fn new(cell: Arc<SettlementCell<T>>) -> Self {
        Self { inner: Arc::new(SealantInner { cell }) }
    }

    /// Returns `false` if the promise was already settled.
    pub fn resolve(&self, resolution: Resolution<T>) -> bool {
        settle(&self.inner.cell, resolution)
    }

    pub fn fulfill(&self, value: T) -> bool {
        self.resolve(Resolution::Fulfilled(value))
    }

    pub fn reject(&self, failure: impl Into<Failure>) -> bool {
        self.resolve(Resolution::Rejected(failure.into()))
    }

    pub fn resolve_result<E: Into<Failure>>(&self, result: Result<T, E>) -> bool {
        self.resolve(result.into())
    }
}

impl<T: Value> Clone for Sealant<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Value> Debug for Sealant<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealant").field("settled", &self.inner.cell.is_settled()).finish()
    }
}

impl<T: Value> Drop for SealantInner<T> {
    fn drop(&mut self) {
        if !self.cell.is_settled() {
            settle(&self.cell, Resolution::Rejected(Error::SealantDropped.into()));
        }
    }
}

/// A value (or failure) that becomes available later.
///
/// A promise is also a [`Future`] resolving to `Result<T, Failure>`.
/// Awaiting observes the outcome without marking a rejection handled.
pub struct Promise<T: Value> {
    cell: Arc<SettlementCell<T>>,
    waiting: Option<oneshot::Receiver<Resolution<T>>>,
}

impl<T: Value> Promise<T> {
    fn from_cell(cell: Arc<SettlementCell<T>>) -> Self {
        Self { cell, waiting: None }
    }

    /// A promise already fulfilled with `value`.
    pub fn fulfilled(value: T) -> Self {
        Self::settled(Resolution::Fulfilled(value))
    }

    /// A promise already rejected with `failure`, recorded as unhandled.
    pub fn rejected(failure: impl Into<Failure>) -> Self {
        Self::settled(Resolution::Rejected(failure.into()))
    }

    pub fn settled(resolution: Resolution<T>) -> Self {
        if let Resolution::Rejected(failure) = &resolution {
            UnhandledTracker::global().record(failure);
        }
        Self::from_cell(Arc::new(SettlementCell::settled(resolution)))
    }

    /// Creates a pending promise and runs `setup` on the calling thread.
    ///
    /// An `Err` returned from (or a panic inside) `setup` rejects the promise
    /// unless it was already resolved; construction itself never fails.
    ///
    /// ```
    /// use sealed_promise::{Failure, Promise};
    /// use futures::executor::block_on;
    ///
    /// let promise = Promise::<u8>::new(|_sealant| Err(Failure::from("no kitten")));
    /// assert_eq!(block_on(promise).unwrap_err().to_string(), "no kitten");
    /// ```
    pub fn new(setup: impl FnOnce(Sealant<T>) -> Result<(), Failure>) -> Self {
        let cell = Arc::new(SettlementCell::pending());
        let sealant = Sealant::new(cell.clone());
        let handed_out = sealant.clone();
        if let Err(failure) = contain(move || setup(handed_out)) {
            sealant.reject(failure);
        }
        Self::from_cell(cell)
    }

    /// A pending promise together with the sealant that resolves it.
    pub fn pending() -> (Self, Sealant<T>) {
        let cell = Arc::new(SettlementCell::pending());
        (Self::from_cell(cell.clone()), Sealant::new(cell))
    }

    /// A promise settled by the completion of a foreign handle.
    pub fn from_foreign<P>(handle: P) -> Self
    where
        P: ForeignPromise,
        P::Outcome: Classify<Value = T>,
    {
        let (promise, sealant) = Self::pending();
        handle.on_complete(Box::new(move |outcome| {
            sealant.resolve(outcome.classify());
        }));
        promise
    }

    /// A promise settled by `future`, which is polled on the background lane.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future + Send + 'static,
        F::Output: Classify<Value = T>,
    {
        Self::from_foreign(Driven(future))
    }

    fn derive<U: Value>(parent: &Promise<U>, body: impl FnOnce(Resolution<U>, Link<T>) + Send + 'static) -> Self {
        let cell = Arc::new(SettlementCell::pending());
        let link = Link { cell: cell.clone() };
        parent.cell.pipe(move |resolution| body(resolution, link));
        Self::from_cell(cell)
    }

    pub fn state(&self) -> State {
        match self.cell.peek() {
            None => State::Pending,
            Some(Resolution::Fulfilled(_)) => State::Fulfilled,
            Some(Resolution::Rejected(_)) => State::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.cell.is_settled()
    }

    /// A snapshot of the resolution, if the promise has settled.
    pub fn resolution(&self) -> Option<Resolution<T>> {
        self.cell.peek()
    }

    /// Transforms the fulfilled value on `context`. Rejections pass through.
    pub fn map_on<U: Value>(
        &self,
        context: Context,
        transform: impl FnOnce(T) -> Result<U, Failure> + Send + 'static,
    ) -> Promise<U> {
        Promise::<U>::derive(self, move |resolution, link| match resolution {
            Resolution::Rejected(failure) => link.forward(Resolution::Rejected(failure)),
            Resolution::Fulfilled(value) => {
                dispatch(&context, move || link.settle(contain(|| transform(value)).into()));
            }
        })
    }

    pub fn map<U: Value>(&self, transform: impl FnOnce(T) -> Result<U, Failure> + Send + 'static) -> Promise<U> {
        self.map_on(Context::Main, transform)
    }

    pub fn map_in_background<U: Value>(
        &self,
        transform: impl FnOnce(T) -> Result<U, Failure> + Send + 'static,
    ) -> Promise<U> {
        self.map_on(Context::Background, transform)
    }

    /// Continues with the promise returned by `transform`.
    pub fn flat_map_on<U: Value>(
        &self,
        context: Context,
        transform: impl FnOnce(T) -> Result<Promise<U>, Failure> + Send + 'static,
    ) -> Promise<U> {
        Promise::<U>::derive(self, move |resolution, link| match resolution {
            Resolution::Rejected(failure) => link.forward(Resolution::Rejected(failure)),
            Resolution::Fulfilled(value) => dispatch(&context, move || match contain(|| transform(value)) {
                Ok(next) => next.cell.pipe(move |resolution| link.forward(resolution)),
                Err(failure) => link.settle(Resolution::Rejected(failure)),
            }),
        })
    }

    pub fn flat_map<U: Value>(
        &self,
        transform: impl FnOnce(T) -> Result<Promise<U>, Failure> + Send + 'static,
    ) -> Promise<U> {
        self.flat_map_on(Context::Main, transform)
    }

    pub fn flat_map_in_background<U: Value>(
        &self,
        transform: impl FnOnce(T) -> Result<Promise<U>, Failure> + Send + 'static,
    ) -> Promise<U> {
        self.flat_map_on(Context::Background, transform)
    }

    /// Continues with a foreign handle returned by `transform`; its outcome
    /// is classified into the derived promise.
    pub fn flat_map_foreign_on<P>(
        &self,
        context: Context,
        transform: impl FnOnce(T) -> Result<P, Failure> + Send + 'static,
    ) -> Promise<<P::Outcome as Classify>::Value>
    where
        P: ForeignPromise,
        <P::Outcome as Classify>::Value: Value,
    {
        Promise::derive(self, move |resolution, link| match resolution {
            Resolution::Rejected(failure) => link.forward(Resolution::Rejected(failure)),
            Resolution::Fulfilled(value) => dispatch(&context, move || match contain(|| transform(value)) {
                Ok(handle) => handle.on_complete(Box::new(move |outcome| link.settle(outcome.classify()))),
                Err(failure) => link.settle(Resolution::Rejected(failure)),
            }),
        })
    }

    pub fn flat_map_foreign<P>(
        &self,
        transform: impl FnOnce(T) -> Result<P, Failure> + Send + 'static,
    ) -> Promise<<P::Outcome as Classify>::Value>
    where
        P: ForeignPromise,
        <P::Outcome as Classify>::Value: Value,
    {
        self.flat_map_foreign_on(Context::Main, transform)
    }

    /// Handles a rejection by producing a value (or another failure).
    /// Fulfillment passes through.
    pub fn recover_on(
        &self,
        context: Context,
        handler: impl FnOnce(Failure) -> Result<T, Failure> + Send + 'static,
    ) -> Promise<T> {
        Promise::derive(self, move |resolution, link| match resolution {
            Resolution::Fulfilled(value) => link.forward(Resolution::Fulfilled(value)),
            Resolution::Rejected(failure) => {
                UnhandledTracker::global().consume(&failure);
                dispatch(&context, move || link.settle(contain(|| handler(failure)).into()));
            }
        })
    }

    pub fn recover(&self, handler: impl FnOnce(Failure) -> Result<T, Failure> + Send + 'static) -> Promise<T> {
        self.recover_on(Context::Main, handler)
    }

    /// Handles a rejection by continuing with another promise.
    pub fn recover_with_on(
        &self,
        context: Context,
        handler: impl FnOnce(Failure) -> Promise<T> + Send + 'static,
    ) -> Promise<T> {
        Promise::derive(self, move |resolution, link| match resolution {
            Resolution::Fulfilled(value) => link.forward(Resolution::Fulfilled(value)),
            Resolution::Rejected(failure) => {
                UnhandledTracker::global().consume(&failure);
                dispatch(&context, move || match contain(|| Ok(handler(failure))) {
                    Ok(next) => next.cell.pipe(move |resolution| link.forward(resolution)),
                    Err(failure) => link.settle(Resolution::Rejected(failure)),
                });
            }
        })
    }

    pub fn recover_with(&self, handler: impl FnOnce(Failure) -> Promise<T> + Send + 'static) -> Promise<T> {
        self.recover_with_on(Context::Main, handler)
    }

    /// Runs `body` once settled, whatever the outcome, then passes the
    /// original resolution along. A panicking body is only logged.
    pub fn finally_on(&self, context: Context, body: impl FnOnce() + Send + 'static) -> Promise<T> {
        Promise::derive(self, move |resolution, link| {
            dispatch(&context, move || {
                if let Err(failure) = contain(|| {
                    body();
                    Ok(())
                }) {
                    tracing::warn!(%failure, "finally body failed, forwarding the original resolution");
                }
                link.forward(resolution);
            });
        })
    }

    pub fn finally(&self, body: impl FnOnce() + Send + 'static) -> Promise<T> {
        self.finally_on(Context::Main, body)
    }

    /// Calls `handler` on the main lane if this promise is rejected, unless
    /// the failure is a cancellation. Ends the chain.
    pub fn report(&self, handler: impl FnOnce(Failure) + Send + 'static) {
        self.report_with(ErrorPolicy::default(), handler);
    }

    /// Like [`report`](Self::report) with an explicit policy. The failure is
    /// marked handled even when the policy skips the handler.
    pub fn report_with(&self, policy: ErrorPolicy, handler: impl FnOnce(Failure) + Send + 'static) {
        self.cell.pipe(move |resolution| {
            let Resolution::Rejected(failure) = resolution else {
                return;
            };
            UnhandledTracker::global().consume(&failure);
            if policy == ErrorPolicy::AllErrorsExceptCancellation && failure.is_cancelled() {
                return;
            }
            dispatch(&Context::Main, move || {
                if let Err(panic) = contain(|| {
                    handler(failure);
                    Ok(())
                }) {
                    tracing::warn!(%panic, "report handler failed");
                }
            });
        });
    }

    pub fn as_void(&self) -> Promise<()> {
        self.map_on(Context::Immediate, |_| Ok(()))
    }
}

impl<T: Value + Sync> Promise<T> {
    pub fn as_any(&self) -> Promise<DynValue> {
        self.map_on(Context::Immediate, |value| Ok(Arc::new(value) as DynValue))
    }
}

/// Runs `body` right away, turning an `Err` (or a panic) into a rejected
/// promise. Makes the head of a chain read like the rest of it.
pub fn firstly<T: Value>(body: impl FnOnce() -> Result<Promise<T>, Failure>) -> Promise<T> {
    contain(body).unwrap_or_else(|failure| Promise::rejected(failure))
}

impl<T: Value> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self::from_cell(self.cell.clone())
    }
}

impl<T: Value + Debug> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("cell", &self.cell).finish()
    }
}

impl<T: Value + Debug> Display for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.cell.peek() {
            None => write!(f, "Promise: Pending"),
            Some(Resolution::Fulfilled(value)) => write!(f, "Promise: Fulfilled({value:?})"),
            Some(Resolution::Rejected(failure)) => write!(f, "Promise: Rejected({failure})"),
        }
    }
}

impl<T: Value> Future for Promise<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.waiting.is_none() {
            if let Some(resolution) = this.cell.peek() {
                return Poll::Ready(resolution.into_result());
            }
            let (sender, receiver) = oneshot::channel();
            this.cell.pipe(move |resolution| {
                // The waiter may have lost interest.
                let _ = sender.send(resolution);
            });
            this.waiting = Some(receiver);
        }
        let Some(receiver) = this.waiting.as_mut() else {
            return Poll::Pending;
        };
        use futures::FutureExt;
        receiver.poll_unpin(cx).map(|received| match received {
            Ok(resolution) => resolution.into_result(),
            Err(canceled) => Err(canceled.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::Mutex;

    fn immediate<T: Value>(promise: &Promise<T>) -> Resolution<T> {
        promise.resolution().expect("promise is still pending")
    }

    #[test]
    fn test_fulfilled_and_rejected_are_sealed() {
        assert_eq!(Promise::fulfilled(1).state(), State::Fulfilled);
        let failure = Failure::from("sealed");
        let rejected = Promise::<u8>::rejected(failure.clone());
        assert_eq!(rejected.state(), State::Rejected);
        assert!(UnhandledTracker::global().is_unconsumed(&failure));
    }

    #[test]
    fn test_new_catches_setup_failure() {
        let promise = Promise::<u8>::new(|_| Err(Failure::from("setup")));
        assert_eq!(immediate(&promise).failure().map(ToString::to_string).as_deref(), Some("setup"));

        let panicked = Promise::<u8>::new(|_| panic!("setup panic"));
        let failure = immediate(&panicked).into_result().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Panicked(_))));
    }

    #[test]
    fn test_new_keeps_first_resolution() {
        let promise = Promise::new(|sealant| {
            sealant.fulfill(5);
            Err(Failure::from("too late"))
        });
        assert_eq!(immediate(&promise), Resolution::Fulfilled(5));
    }

    #[test]
    fn test_dropped_sealant_rejects() {
        let (promise, sealant) = Promise::<u8>::pending();
        let clone = sealant.clone();
        drop(sealant);
        assert!(promise.is_pending());
        drop(clone);
        let failure = immediate(&promise).into_result().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::SealantDropped)));
    }

    #[test]
    fn test_setup_may_keep_sealant() {
        let stash = Arc::new(Mutex::new(None));
        let slot = stash.clone();
        let promise = Promise::<u8>::new(move |sealant| {
            *slot.lock().unwrap() = Some(sealant);
            Ok(())
        });
        assert!(promise.is_pending());
        stash.lock().unwrap().take().unwrap().fulfill(3);
        assert_eq!(immediate(&promise), Resolution::Fulfilled(3));
    }

    #[test]
    fn test_map_propagates_rejection_unchanged() {
        let failure = Failure::from("upstream");
        let mapped = Promise::<u8>::rejected(failure.clone()).map_on(Context::Immediate, |v| Ok(v + 1));
        assert_eq!(immediate(&mapped), Resolution::Rejected(failure));
    }

    #[test]
    fn test_map_transform_error_rejects() {
        let thrown = Failure::from("thrown");
        let expected = thrown.clone();
        let mapped = Promise::fulfilled(1u8).map_on(Context::Immediate, move |_| Err::<u8, _>(thrown));
        assert_eq!(immediate(&mapped), Resolution::Rejected(expected.clone()));
        assert!(UnhandledTracker::global().is_unconsumed(&expected));
    }

    #[test]
    fn test_recover_consumes_even_when_rethrowing() {
        let original = Failure::from("original");
        let replacement = Failure::from("replacement");
        let expected = replacement.clone();
        let recovered = Promise::<u8>::rejected(original.clone())
            .recover_on(Context::Immediate, move |_| Err(replacement));
        assert!(!UnhandledTracker::global().is_unconsumed(&original));
        assert_eq!(immediate(&recovered), Resolution::Rejected(expected));
    }

    #[test]
    fn test_recover_passes_fulfillment() {
        let recovered = Promise::fulfilled(4u8).recover_on(Context::Immediate, |_| Ok(0));
        assert_eq!(immediate(&recovered), Resolution::Fulfilled(4));
    }

    #[test]
    fn test_recover_with_pipes_promise() {
        let failure = Failure::from("boom");
        let recovered = Promise::<u8>::rejected(failure.clone())
            .recover_with_on(Context::Immediate, |_| Promise::fulfilled(0));
        assert_eq!(immediate(&recovered), Resolution::Fulfilled(0));
        assert!(!UnhandledTracker::global().is_unconsumed(&failure));
    }

    #[test]
    fn test_flat_map_follows_inner_promise() {
        let (inner, sealant) = Promise::<u8>::pending();
        let outer = Promise::fulfilled(()).flat_map_on(Context::Immediate, move |_| Ok(inner));
        assert!(outer.is_pending());
        let failure = Failure::from("inner");
        sealant.reject(failure.clone());
        assert_eq!(immediate(&outer), Resolution::Rejected(failure));
    }

    #[test]
    fn test_finally_forwards_original_resolution() {
        let failure = Failure::from("E");
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let after = Promise::<u8>::rejected(failure.clone()).finally_on(Context::Immediate, move || {
            *flag.lock().unwrap() = true;
            panic!("side effect failed");
        });
        assert!(*ran.lock().unwrap());
        assert_eq!(immediate(&after), Resolution::Rejected(failure));
    }

    #[test]
    fn test_as_void_and_as_any() {
        assert_eq!(immediate(&Promise::fulfilled(9u8).as_void()), Resolution::Fulfilled(()));
        let erased = immediate(&Promise::fulfilled(9u8).as_any()).into_result().unwrap();
        assert_eq!(erased.downcast_ref::<u8>(), Some(&9));
    }

    #[test]
    fn test_firstly() {
        assert_eq!(immediate(&firstly(|| Ok(Promise::fulfilled(1)))), Resolution::Fulfilled(1));
        let rejected = firstly::<u8>(|| Err(Failure::from("head")));
        assert_eq!(rejected.state(), State::Rejected);
    }

    #[test]
    fn test_display() {
        let (pending, _sealant) = Promise::<u8>::pending();
        assert_eq!(pending.to_string(), "Promise: Pending");
        assert_eq!(Promise::fulfilled(2u8).to_string(), "Promise: Fulfilled(2)");
        assert_eq!(Promise::<u8>::rejected("bad").to_string(), "Promise: Rejected(bad)");
    }

    #[test]
    fn test_losing_settle_keeps_winning_record() {
        let failure = Failure::from("shared");
        let cell = SettlementCell::<u8>::pending();
        // Settled by a racing sealant clone that has not recorded yet.
        assert!(cell.resolve(Resolution::Rejected(failure.clone())));
        assert!(!settle(&cell, Resolution::Rejected(failure.clone())));
        assert!(UnhandledTracker::global().is_unconsumed(&failure));

        let other = Failure::from("other");
        assert!(!settle(&cell, Resolution::Rejected(other.clone())));
        assert!(!UnhandledTracker::global().is_unconsumed(&other));
        UnhandledTracker::global().consume(&failure);
    }

    #[test]
    fn test_await_pending_then_settled() {
        let (promise, sealant) = Promise::<u8>::pending();
        let waiter = std::thread::spawn(move || block_on(promise));
        sealant.fulfill(6);
        assert_eq!(waiter.join().unwrap().unwrap(), 6);

        let failure = Failure::from("awaited");
        let rejected = Promise::<u8>::rejected(failure.clone());
        assert_eq!(block_on(rejected.clone()).unwrap_err(), failure);
        assert!(UnhandledTracker::global().is_unconsumed(&failure));
        UnhandledTracker::global().consume(&failure);
    }

    #[test]
    fn test_await_default_context() {
        let promise = Promise::fulfilled(20u32).map(|v| Ok(v * 2)).map_in_background(|v| Ok(v + 2));
        assert_eq!(block_on(promise).unwrap(), 42);
    }
}
