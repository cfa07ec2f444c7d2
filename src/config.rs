//! Runtime configuration for the built-in executor and the unhandled
//! rejection sweeper.

use std::{env, thread, time::Duration};

pub const BACKGROUND_THREADS_ENV: &str = "SEALED_PROMISE_BACKGROUND_THREADS";
pub const MAIN_LANE_ENV: &str = "SEALED_PROMISE_MAIN_LANE";
pub const UNHANDLED_GRACE_ENV: &str = "SEALED_PROMISE_UNHANDLED_GRACE_MS";
pub const SWEEP_INTERVAL_ENV: &str = "SEALED_PROMISE_SWEEP_INTERVAL_MS";

const DEFAULT_UNHANDLED_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size of the background thread pool.
    pub background_threads: usize,
    /// Name of the serial foreground lane (its thread is `promise-<name>`).
    pub main_lane: String,
    /// How long a rejection may stay unconsumed before it is reported.
    pub unhandled_grace: Duration,
    /// Period of the sweeper thread; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            background_threads: thread::available_parallelism().map_or(4, usize::from),
            main_lane: "main".to_owned(),
            unhandled_grace: DEFAULT_UNHANDLED_GRACE,
            sweep_interval: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment.
    ///
    /// Unset or unparsable variables keep their default. A zero sweep
    /// interval leaves the sweeper disabled.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            background_threads: read_env(BACKGROUND_THREADS_ENV).unwrap_or(defaults.background_threads),
            main_lane: env::var(MAIN_LANE_ENV).ok().filter(|name| !name.is_empty()).unwrap_or(defaults.main_lane),
            unhandled_grace: read_env(UNHANDLED_GRACE_ENV).map_or(defaults.unhandled_grace, Duration::from_millis),
            sweep_interval: read_env(SWEEP_INTERVAL_ENV)
                .filter(|millis| *millis > 0)
                .map(Duration::from_millis)
                .or(defaults.sweep_interval),
        }
    }

    #[must_use]
    pub fn with_background_threads(mut self, threads: usize) -> Self {
        self.background_threads = threads;
        self
    }

    #[must_use]
    pub fn with_main_lane(mut self, name: impl Into<String>) -> Self {
        self.main_lane = name.into();
        self
    }

    #[must_use]
    pub fn with_unhandled_grace(mut self, grace: Duration) -> Self {
        self.unhandled_grace = grace;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
