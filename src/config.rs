//! Environment variable configuration
//!
//! `ThreadPoolBuilder::from_env` reads the variables below, falling back to the
//! builder's defaults when a variable is unset or doesn't parse.
//!
//! | Variable                          | Meaning                                   |
//! |-----------------------------------|-------------------------------------------|
//! | `SEQPOOL_WORKERS`                 | initial worker capacity                   |
//! | `SEQPOOL_RECLAIM_MS`              | idle time before a worker is reclaimed    |
//! | `SEQPOOL_MAX_BACKGROUND`          | max scheduled background sequences        |
//! | `SEQPOOL_MAY_BLOCK_THRESHOLD_MS`  | blocking time before capacity is raised   |

use std::str::FromStr;
use std::time::Duration;

pub const WORKERS_VAR: &str = "SEQPOOL_WORKERS";
pub const RECLAIM_MS_VAR: &str = "SEQPOOL_RECLAIM_MS";
pub const MAX_BACKGROUND_VAR: &str = "SEQPOOL_MAX_BACKGROUND";
pub const MAY_BLOCK_THRESHOLD_MS_VAR: &str = "SEQPOOL_MAY_BLOCK_THRESHOLD_MS";

/// Get an environment variable parsed as `T`, or `default`.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Get an environment variable parsed as `T`, if it is set and valid.
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring an invalid configuration value");
            None
        }
    }
}

/// Get an environment variable holding a number of milliseconds.
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map_or(default, Duration::from_millis)
}

#[test]
fn parses_variables() {
    std::env::set_var("SEQPOOL_TEST_NUMBER", " 12 ");
    std::env::set_var("SEQPOOL_TEST_GARBAGE", "twelve");

    assert_eq!(env_get::<usize>("SEQPOOL_TEST_NUMBER", 3), 12);
    assert_eq!(env_get::<usize>("SEQPOOL_TEST_GARBAGE", 3), 3);
    assert_eq!(env_get::<usize>("SEQPOOL_TEST_UNSET", 3), 3);
    assert_eq!(env_get_millis("SEQPOOL_TEST_NUMBER", Duration::ZERO), Duration::from_millis(12));
}
