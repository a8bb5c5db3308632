//! Tracing setup for diskport.
//!
//! Human-readable output goes to stderr so it never mixes with anything a
//! supervisor might parse from stdout. JSON output is available for journald
//! or log shippers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Emit one JSON object per event
    pub json: bool,
    /// Default to DEBUG instead of INFO
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.log_json,
            verbose: config.verbose,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the level derived from
/// `verbose`. Calling it twice is harmless; the second call is ignored.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "diskport={}",
            default_level.as_str().to_lowercase()
        ))
    });

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("diskport: logging already initialised: {e}");
    }
}

/// Rate limiter for progress messages emitted from tight copy loops.
pub struct LogThrottle {
    interval_ms: u64,
    /// Last log time in ms since `start`, or `NEVER_LOGGED`
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// True when at least `interval` has passed since the last `true`.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        due && self
            .last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
