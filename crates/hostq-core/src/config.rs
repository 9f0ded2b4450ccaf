use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_EXPLORATION_THRESHOLD: usize = 64;
pub const DEFAULT_BACKPRESSURE_IN_FLIGHT: usize = 2;
pub const DEFAULT_REAP_BATCH: usize = 16;

/// How commands released by the engine (reaped from a queue or dropped from a wait list) are
/// destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    /// Drop on the releasing thread, after every lock has been released.
    #[default]
    Immediate,
    /// Park on the owning queue and drop from the application-facing calls (`queue_command`,
    /// `flush`, `finish`). For hosts whose allocator must not be used from backend threads.
    Deferred,
}

impl FromStr for ReleaseMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "immediate" => Ok(Self::Immediate),
            "deferred" => Ok(Self::Deferred),
            _ => Err(()),
        }
    }
}

/// Tunables of the admission algorithm. None of them affect correctness, only how much work a
/// single admission pass or reaping pass performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of unfinished commands a general (unseeded) admission pass inspects.
    pub exploration_threshold: usize,
    /// Out-of-order queues skip general passes while the backend holds more than this many of
    /// their commands and reports it has enough to work on.
    pub backpressure_in_flight: usize,
    /// Number of locally completed commands that must accumulate before `clean_commands` walks the
    /// pending list while work is still in flight.
    pub reap_batch: usize,
    pub release_mode: ReleaseMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            exploration_threshold: DEFAULT_EXPLORATION_THRESHOLD,
            backpressure_in_flight: DEFAULT_BACKPRESSURE_IN_FLIGHT,
            reap_batch: DEFAULT_REAP_BATCH,
            release_mode: ReleaseMode::Immediate,
        }
    }
}

impl QueueConfig {
    /// Read `HOSTQ_EXPLORATION_THRESHOLD`, `HOSTQ_BACKPRESSURE_IN_FLIGHT`, `HOSTQ_REAP_BATCH` and
    /// `HOSTQ_RELEASE_MODE` (`immediate` or `deferred`), falling back to the defaults for unset
    /// variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            exploration_threshold: parse_var(
                &lookup,
                "HOSTQ_EXPLORATION_THRESHOLD",
                defaults.exploration_threshold,
            )?,
            backpressure_in_flight: parse_var(
                &lookup,
                "HOSTQ_BACKPRESSURE_IN_FLIGHT",
                defaults.backpressure_in_flight,
            )?,
            reap_batch: parse_var(&lookup, "HOSTQ_REAP_BATCH", defaults.reap_batch)?,
            release_mode: parse_var(&lookup, "HOSTQ_RELEASE_MODE", defaults.release_mode)?,
        })
    }
}

/// Parse an optional variable, keeping `default` when it is unset or blank.
pub fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidEnv(name)),
        _ => Ok(default),
    }
}
