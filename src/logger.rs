//! Logging: the `tracing` subscriber for the daemon, and a bus subscriber that
//! records every classified event.
//!
//! Configure via the `RUST_LOG` environment variable:
//! - `RUST_LOG=debug` - every classified event and subscriber change
//! - `RUST_LOG=keyrelay::pipeline=trace` - raw and unresolved codes of one stage

use crate::event::ClassifiedEvent;
use crate::eventbus::{Disconnected, Subscriber};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber. Defaults to `info` when `RUST_LOG`
/// is unset or invalid; calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Logs each delivered event at debug level.
#[derive(Debug, Default)]
pub struct LogSubscriber;

impl LogSubscriber {
    pub fn new() -> Self {
        LogSubscriber
    }
}

impl Subscriber for LogSubscriber {
    fn deliver(&mut self, event: &ClassifiedEvent) -> Result<(), Disconnected> {
        debug!(
            key = %event.key,
            action = ?event.action,
            source = %event.source,
            "input"
        );
        Ok(())
    }
}
