//! Built-in executors.
//!
//! [`LaneExecutor`] gives every serial lane (the main lane and each named
//! lane) its own worker thread fed by a channel, and runs background work on
//! a `futures` thread pool. [`InlineExecutor`] runs everything on the calling
//! thread.

use crate::{
    context::{Executor, Lane, Work},
    Config, Error, Failure,
};
use futures::executor::ThreadPool;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Sender},
        Arc,
    },
    thread::{self, ThreadId},
};

const THREAD_PREFIX: &str = "promise-";

/// A FIFO lane backed by one worker thread.
#[derive(Debug)]
struct SerialLane {
    sender: Sender<Work>,
    thread: ThreadId,
}

impl SerialLane {
    fn spawn(name: &str) -> Result<Self, Error> {
        let (sender, receiver) = channel::<Work>();
        let handle = thread::Builder::new().name(format!("{THREAD_PREFIX}{name}")).spawn(move || {
            for work in receiver {
                run(work);
            }
        })?;
        tracing::debug!(lane = name, "started serial lane");
        Ok(Self { sender, thread: handle.thread().id() })
    }

    fn submit(&self, work: Work) {
        // The worker only exits once every sender is gone.
        if let Err(rejected) = self.sender.send(work) {
            tracing::warn!("serial lane is gone, running work inline");
            run(rejected.0);
        }
    }
}

fn run(work: Work) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
        tracing::warn!(panic = %Failure::from_panic(payload), "work item panicked");
    }
}

/// Serial main lane, lazily spawned named lanes and a background pool.
pub struct LaneExecutor {
    main: SerialLane,
    background: ThreadPool,
    named: Mutex<HashMap<Arc<str>, SerialLane>>,
}

impl LaneExecutor {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let main = SerialLane::spawn(&config.main_lane)?;
        let background = ThreadPool::builder()
            .pool_size(config.background_threads.max(1))
            .name_prefix(format!("{THREAD_PREFIX}background-"))
            .create()?;
        tracing::debug!(threads = config.background_threads, "started background pool");
        Ok(Self { main, background, named: Mutex::new(HashMap::new()) })
    }

    fn schedule_named(&self, name: Arc<str>, work: Work) {
        let mut named = self.named.lock();
        if let Some(lane) = named.get(&name) {
            lane.submit(work);
            return;
        }
        match SerialLane::spawn(&name) {
            Ok(lane) => {
                lane.submit(work);
                named.insert(name, lane);
            }
            Err(error) => {
                drop(named);
                tracing::error!(lane = %name, %error, "cannot spawn lane, running work inline");
                run(work);
            }
        }
    }
}

impl Executor for LaneExecutor {
    fn schedule(&self, lane: Lane, work: Work) {
        match lane {
            Lane::Main => self.main.submit(work),
            Lane::Background => self.background.spawn_ok(async move { run(work) }),
            Lane::Named(name) => self.schedule_named(name, work),
        }
    }

    fn is_foreground(&self) -> bool {
        thread::current().id() == self.main.thread
    }
}

/// Runs every work item on the calling thread. Has no foreground lane.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn schedule(&self, _lane: Lane, work: Work) {
        run(work);
    }

    fn is_foreground(&self) -> bool {
        false
    }
}
