//! The terminal outcome of an asynchronous computation.
//!
//! A [`Resolution`] is either `Fulfilled` with a value or `Rejected` with a
//! [`Failure`]. Failures are compared by identity: two failures are equal
//! only when they are clones of the same rejection, which is what the
//! unhandled-rejection bookkeeping keys on.

use crate::{Error, UnhandledTracker};
use std::{
    any::Any,
    error::Error as StdError,
    fmt::{self, Debug, Display, Formatter},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

/// An opaque, cheaply cloneable failure payload.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<Inner>,
}

struct Inner {
    error: Box<dyn StdError + Send + Sync>,
    cancelled: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let id = self as *const Inner as *const () as usize;
        if UnhandledTracker::global().forget(id) {
            tracing::debug!(
                error = %self.error,
                cancelled = self.cancelled,
                "dropped an unhandled promise rejection"
            );
        }
    }
}

/// A non-owning reference to a [`Failure`], as kept by the tracker.
#[derive(Clone, Debug)]
pub(crate) struct WeakFailure {
    inner: Weak<Inner>,
}

impl WeakFailure {
    pub(crate) fn upgrade(&self) -> Option<Failure> {
        self.inner.upgrade().map(|inner| Failure { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl Failure {
    /// Wraps any error (or message) as a new failure.
    ///
    /// ```
    /// use sealed_promise::Failure;
    /// let a = Failure::new("boom");
    /// let b = a.clone();
    /// assert_eq!(a, b);
    /// assert_ne!(a, Failure::new("boom"));
    /// ```
    pub fn new(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::with_tag(error.into(), false)
    }

    /// Wraps `error` as a cancellation-class failure.
    pub fn cancellation(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::with_tag(error.into(), true)
    }

    /// A cancellation-class failure carrying [`Error::Cancelled`].
    pub fn cancelled() -> Self {
        Self::cancellation(Error::Cancelled)
    }

    fn with_tag(error: Box<dyn StdError + Send + Sync>, cancelled: bool) -> Self {
        Self { inner: Arc::new(Inner { error, cancelled }) }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(payload) => match payload.downcast::<String>() {
                Ok(message) => *message,
                Err(_) => "<opaque panic payload>".to_owned(),
            },
        };
        Self::new(Error::Panicked(message))
    }

    /// Whether this failure represents voluntary cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled
    }

    /// Whether `self` and `other` are the same rejection.
    pub fn same_as(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identity key, stable for as long as any clone (or weak reference) is
    /// alive.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn downgrade(&self) -> WeakFailure {
        WeakFailure { inner: Arc::downgrade(&self.inner) }
    }

    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner.error
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.error.downcast_ref::<E>()
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}
impl Eq for Failure {}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.inner.error, f)
    }
}
impl Debug for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("error", &self.inner.error)
            .field("cancelled", &self.inner.cancelled)
            .finish()
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        let cancelled = matches!(error, Error::Cancelled);
        Self::with_tag(Box::new(error), cancelled)
    }
}
impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self::new(Error::Message(message.to_owned()))
    }
}
impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::new(Error::Message(message))
    }
}

/// Either a value or a failure. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Fulfilled(T),
    Rejected(Failure),
}

impl<T> Resolution<T> {
    pub const fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fulfilled(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Fulfilled(_) => None,
            Self::Rejected(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Rejected(failure) => Err(failure),
        }
    }

    /// Transforms the fulfilled value, keeping a failure as is.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Fulfilled(value) => Resolution::Fulfilled(f(value)),
            Self::Rejected(failure) => Resolution::Rejected(failure),
        }
    }
}

impl<T, E: Into<Failure>> From<Result<T, E>> for Resolution<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Fulfilled(value),
            Err(error) => Self::Rejected(error.into()),
        }
    }
}

/// Runs `body`, turning a panic into a [`Error::Panicked`] failure.
pub(crate) fn contain<R>(body: impl FnOnce() -> Result<R, Failure>) -> Result<R, Failure> {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| Err(Failure::from_panic(payload)))
}
