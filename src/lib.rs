//! Chainable promises built on a single-assignment settlement cell.
//!
//! A [`Promise`] settles exactly once, either fulfilled with a value or
//! rejected with a [`Failure`]. Operators such as [`Promise::map`],
//! [`Promise::flat_map`], [`Promise::recover`] and [`Promise::finally`]
//! register a continuation and return a new promise immediately; the
//! continuation runs on the [`Context`] it was given once the parent settles.
//!
//! Rejections that no `recover` or `report` ever sees are kept in the
//! [`UnhandledTracker`] and reported by a sweep.
//!
//! ```
//! use sealed_promise::{Context, Promise};
//! use futures::executor::block_on;
//!
//! let recovered = Promise::<u32>::rejected("boom")
//!     .map_on(Context::Immediate, |x| Ok(x * 2))
//!     .recover_on(Context::Immediate, |_| Ok(0));
//! assert_eq!(block_on(recovered).unwrap(), 0);
//! ```

mod cell;
mod config;
mod context;
mod error;
mod executor;
mod foreign;
mod promise;
mod resolution;
mod tracker;

pub use cell::{Handler, Seal, SettlementCell};
pub use config::Config;
pub use context::{executor, install_executor, Context, Executor, Lane, Work};
pub use error::Error;
pub use executor::{InlineExecutor, LaneExecutor};
pub use foreign::{Classify, Completion, Driven, DynValue, ForeignPromise};
pub use promise::{firstly, ErrorPolicy, Promise, Sealant, State};
pub use resolution::{Failure, Resolution};
pub use tracker::{spawn_sweeper, DiagnosticSink, TracingSink, UnhandledTracker};

use std::sync::Arc;

/// Anything a promise can carry: cloned once per continuation and moved
/// between threads.
pub trait Value: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Value for T {}

/// Installs a [`LaneExecutor`] built from `config` as the process-wide
/// executor and, if `config.sweep_interval` is set, starts the sweeper that
/// logs unhandled rejections.
pub fn init(config: Config) -> Result<(), Error> {
    let executor = LaneExecutor::new(&config)?;
    install_executor(Arc::new(executor))?;
    if let Some(interval) = config.sweep_interval {
        spawn_sweeper(interval, config.unhandled_grace, Arc::new(TracingSink))?;
    }
    tracing::debug!(main_lane = %config.main_lane, "promise runtime initialised");
    Ok(())
}
