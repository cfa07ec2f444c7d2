//! Bookkeeping for rejections nobody has handled.
//!
//! Every rejection created by a promise is recorded here; `recover` and
//! `report` consume it. A sweep reports whatever has been sitting in the
//! table longer than a grace period. Sweeping only affects diagnostics.

use crate::{resolution::WeakFailure, Error, Failure};
use parking_lot::{const_mutex, Mutex};
use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Receives unhandled rejections found by a sweep.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, failure: &Failure, context: &str);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&Failure, &str) + Send + Sync,
{
    fn report(&self, failure: &Failure, context: &str) {
        self(failure, context)
    }
}

/// Logs unhandled rejections as warnings.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, failure: &Failure, context: &str) {
        tracing::warn!(%failure, cancelled = failure.is_cancelled(), context, "unhandled promise rejection");
    }
}

#[derive(Debug)]
struct Entry {
    failure: WeakFailure,
    recorded_at: Instant,
}

/// Identity-keyed table of unconsumed rejections.
///
/// Entries hold weak references: once every clone of a failure is gone it
/// can no longer be handled or reported, and its entry is dropped.
#[derive(Debug)]
pub struct UnhandledTracker {
    entries: Mutex<BTreeMap<usize, Entry>>,
}

static GLOBAL: UnhandledTracker = UnhandledTracker::new();

impl UnhandledTracker {
    pub const fn new() -> Self {
        Self { entries: const_mutex(BTreeMap::new()) }
    }

    /// The process-wide tracker promises record into.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Marks `failure` as unconsumed. Returns `false` if it already was.
    pub fn record(&self, failure: &Failure) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&failure.id()) {
            return false;
        }
        entries.insert(failure.id(), Entry { failure: failure.downgrade(), recorded_at: Instant::now() });
        true
    }

    /// Marks `failure` as handled. Returns `false` if it was not recorded.
    pub fn consume(&self, failure: &Failure) -> bool {
        self.entries.lock().remove(&failure.id()).is_some()
    }

    /// Drops the entry of a failure whose last clone went away.
    pub(crate) fn forget(&self, id: usize) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn is_unconsumed(&self, failure: &Failure) -> bool {
        self.entries.lock().contains_key(&failure.id())
    }

    /// Number of live unconsumed rejections.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.failure.is_alive());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every rejection older than `grace` and reports it to `sink`.
    ///
    /// The sink is called after the table lock is released. Returns the
    /// number of reported rejections.
    pub fn sweep(&self, grace: Duration, sink: &dyn DiagnosticSink) -> usize {
        let now = Instant::now();
        let expired: Vec<Entry> = {
            let mut entries = self.entries.lock();
            entries.retain(|_, entry| entry.failure.is_alive());
            let ids: Vec<usize> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.recorded_at) >= grace)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
        };

        let mut reported = 0;
        for entry in &expired {
            // Upgraded outside the lock: the last clone may be dropped here.
            let Some(failure) = entry.failure.upgrade() else {
                continue;
            };
            let context = format!(
                "rejected {:?} ago and never recovered or reported",
                now.saturating_duration_since(entry.recorded_at)
            );
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| sink.report(&failure, &context)));
            if let Err(payload) = delivered {
                tracing::warn!(panic = %Failure::from_panic(payload), "diagnostic sink panicked");
            }
            reported += 1;
        }
        reported
    }
}

impl Default for UnhandledTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts a detached thread sweeping the global tracker every `interval`.
///
/// A zero `interval` is rejected with [`Error::Config`].
pub fn spawn_sweeper(
    interval: Duration,
    grace: Duration,
    sink: Arc<dyn DiagnosticSink>,
) -> Result<JoinHandle<()>, Error> {
    if interval.is_zero() {
        return Err(Error::Config("sweep interval must be greater than zero".to_owned()));
    }
    let handle = thread::Builder::new().name("promise-sweeper".to_owned()).spawn(move || loop {
        thread::sleep(interval);
        let reported = UnhandledTracker::global().sweep(grace, &*sink);
        if reported > 0 {
            tracing::debug!(reported, "swept unhandled rejections");
        }
    })?;
    Ok(handle)
}
