//! Execution contexts and the executor capability continuations run on.
//!
//! The crate owns no scheduling policy of its own: a [`Context`] is resolved
//! either to "run right here" or to a [`Lane`] handed to the installed
//! [`Executor`].

use crate::{
    executor::{InlineExecutor, LaneExecutor},
    Config, Error,
};
use std::sync::{Arc, OnceLock};

/// A unit of work submitted to an executor.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Where a continuation runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Context {
    /// On whichever thread settles the parent (or registers, if the parent
    /// is already settled). Nothing is scheduled.
    Immediate,
    /// Immediately, unless the current thread is the foreground lane, in
    /// which case the work is moved to the background lane.
    DeferredIfForeground,
    /// Always queued onto the serial main lane.
    #[default]
    Main,
    Background,
    /// A named serial lane.
    Lane(Arc<str>),
}

impl Context {
    pub fn lane(name: impl Into<Arc<str>>) -> Self {
        Self::Lane(name.into())
    }
}

/// A logical queue an executor can run work on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    Main,
    Background,
    Named(Arc<str>),
}

/// The external capability that runs work later.
///
/// Work submitted to `Main` or to the same `Named` lane must run in
/// submission order. `Background` carries no ordering guarantee.
pub trait Executor: Send + Sync + 'static {
    fn schedule(&self, lane: Lane, work: Work);

    /// Whether the calling thread is the privileged foreground lane.
    fn is_foreground(&self) -> bool;
}

static EXECUTOR: OnceLock<Arc<dyn Executor>> = OnceLock::new();

/// Installs `executor` as the process-wide executor.
///
/// Fails with [`Error::ExecutorInstalled`] once an executor is in place,
/// including the default one installed lazily by the first dispatch.
pub fn install_executor(executor: Arc<dyn Executor>) -> Result<(), Error> {
    EXECUTOR.set(executor).map_err(|_| Error::ExecutorInstalled)
}

/// The installed executor, installing a default [`LaneExecutor`] if needed.
pub fn executor() -> &'static Arc<dyn Executor> {
    EXECUTOR.get_or_init(|| match LaneExecutor::new(&Config::default()) {
        Ok(executor) => Arc::new(executor) as Arc<dyn Executor>,
        Err(error) => {
            tracing::error!(%error, "cannot start the default executor, running continuations inline");
            Arc::new(InlineExecutor)
        }
    })
}

/// Runs `work` according to `context`.
pub(crate) fn dispatch(context: &Context, work: impl FnOnce() + Send + 'static) {
    match context {
        Context::Immediate => work(),
        Context::DeferredIfForeground => {
            let executor = executor();
            if executor.is_foreground() {
                executor.schedule(Lane::Background, Box::new(work));
            } else {
                work();
            }
        }
        Context::Main => executor().schedule(Lane::Main, Box::new(work)),
        Context::Background => executor().schedule(Lane::Background, Box::new(work)),
        Context::Lane(name) => executor().schedule(Lane::Named(name.clone()), Box::new(work)),
    }
}
