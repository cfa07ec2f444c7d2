#![allow(dead_code)]
//! Shared integration test utilities.

use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::Once;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "SEALED_PROMISE_PROPTEST_SEED";

/// How long a test waits for something scheduled on a lane.
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging once per test binary.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_thread_names(true)
            .try_init();
    });
}

/// Build a ProptestConfig, pinning the seed under CI.
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        let seed = std::env::var(PROPTEST_SEED_ENV)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .or_else(|| std::env::var("CI").ok().map(|_| DEFAULT_PROPTEST_SEED));
        if let Some(seed) = seed {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}
