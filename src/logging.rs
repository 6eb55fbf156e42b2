//! Tracing setup for the ripping daemon.
//!
//! Runner events carry the `job` span (`job_id`, `disc_type`). The console
//! format shows it inline, the JSON format flattens it into each record so
//! a log shipper can group lines per disc. `RUST_LOG` always wins.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Lower the default filter from INFO to DEBUG, which includes step
    /// output mirrored from the job log.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Filter used when `RUST_LOG` is unset. Dependencies stay at warn.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("warn,ripd={}", level)
}

/// Install the global subscriber. Call once, after config is loaded.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact().with_target(false))
            .init();
    }
}

/// Rate limiter for per-line step diagnostics.
///
/// A rip can print a progress line per sector batch. The runner keeps one
/// throttle per job, resets it when a step starts, and reports how many
/// events were dropped since the last one let through.
pub struct LogThrottle {
    interval: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last: Option<Instant>,
    skipped: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// `Some(skipped)` if this event should be logged, where `skipped` is the
    /// number of events suppressed since the previous one. `None` otherwise.
    pub fn admit(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        match state.last {
            Some(last) if now.duration_since(last) < self.interval => {
                state.skipped += 1;
                None
            }
            _ => {
                state.last = Some(now);
                Some(std::mem::take(&mut state.skipped))
            }
        }
    }

    /// Start a fresh window; the next event is admitted.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ThrottleState::default();
    }
}
