//! A single-assignment cell that transitions exactly once from pending to
//! settled and fans the settlement out to every registered handler.
//!
//! The lock only guards the state tag and the handler list. Handlers run
//! after it has been released, so a handler is free to settle or pipe into
//! other cells (which is how chains are wired).

use crate::{Resolution, Value};
use parking_lot::Mutex;
use std::fmt::{self, Debug, Formatter};

/// A continuation waiting for the settlement of a cell.
pub type Handler<T> = Box<dyn FnOnce(Resolution<T>) + Send + 'static>;

/// The settlement view handed to a [`SettlementCell::get`] observer.
pub enum Seal<'a, T> {
    /// Still pending; the observer may append to the handler list.
    Pending(&'a mut Vec<Handler<T>>),
    Resolved(&'a Resolution<T>),
}

enum State<T> {
    Pending(Vec<Handler<T>>),
    Settled(Resolution<T>),
}

pub struct SettlementCell<T> {
    state: Mutex<State<T>>,
}

impl<T: Value> SettlementCell<T> {
    pub fn pending() -> Self {
        Self { state: Mutex::new(State::Pending(Vec::new())) }
    }

    pub fn settled(resolution: Resolution<T>) -> Self {
        Self { state: Mutex::new(State::Settled(resolution)) }
    }

    /// Calls `observer` with the current settlement view while holding the
    /// cell exclusively.
    ///
    /// The observer must not call back into this same cell.
    pub fn get<R>(&self, observer: impl FnOnce(Seal<'_, T>) -> R) -> R {
        let mut state = self.state.lock();
        match &mut *state {
            State::Pending(handlers) => observer(Seal::Pending(handlers)),
            State::Settled(resolution) => observer(Seal::Resolved(resolution)),
        }
    }

    /// Settles the cell if it is still pending and then runs every registered
    /// handler in registration order.
    ///
    /// Returns `false` (and does nothing) if the cell was already settled.
    pub fn resolve(&self, resolution: Resolution<T>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if let State::Settled(_) = &*state {
                tracing::trace!(rejected = resolution.is_rejected(), "ignoring settlement of an already settled cell");
                return false;
            }
            std::mem::replace(&mut *state, State::Settled(resolution.clone()))
        };
        let State::Pending(handlers) = previous else {
            return false;
        };

        for handler in handlers {
            handler(resolution.clone());
        }
        true
    }

    /// Registers `handler`, or runs it right away on the calling thread if
    /// the cell is already settled.
    pub fn pipe(&self, handler: impl FnOnce(Resolution<T>) + Send + 'static) {
        let mut handler = Some(handler);
        let settled = self.get(|seal| match seal {
            Seal::Pending(handlers) => {
                if let Some(handler) = handler.take() {
                    handlers.push(Box::new(handler));
                }
                None
            }
            Seal::Resolved(resolution) => Some(resolution.clone()),
        });

        if let (Some(resolution), Some(handler)) = (settled, handler) {
            handler(resolution);
        }
    }

    /// A snapshot of the settlement, if any.
    pub fn peek(&self) -> Option<Resolution<T>> {
        self.get(|seal| match seal {
            Seal::Pending(_) => None,
            Seal::Resolved(resolution) => Some(resolution.clone()),
        })
    }

    pub fn is_settled(&self) -> bool {
        self.get(|seal| matches!(seal, Seal::Resolved(_)))
    }
}

impl<T: Value + Debug> Debug for SettlementCell<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.peek() {
            Some(resolution) => f.debug_tuple("Settled").field(&resolution).finish(),
            None => f.write_str("Pending"),
        }
    }
}
