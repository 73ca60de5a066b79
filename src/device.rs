//! Sampler capability shared by every physical source.
//!
//! A sampler owns exactly one physical resource (a set of GPIO lines, the lircd
//! socket, the MPR121 register bus) and turns it into [`RawEvent`]s. Hardware
//! specifics stay behind this trait so the rest of the pipeline is source-agnostic.

use crate::event::{RawEvent, SourceKind};
use std::time::Duration;

/// Why a sample attempt produced nothing useful.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The device could not be reached. The pipeline backs off and calls
    /// [`Sampler::recover`] before sampling again.
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// The device delivered data that cannot be interpreted (garbled line,
    /// unsupported protocol). Dropped and counted; sampling continues.
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for SampleError {
    fn from(e: std::io::Error) -> Self {
        SampleError::Unavailable(e.to_string())
    }
}

pub trait Sampler: Send {
    fn source(&self) -> SourceKind;

    /// Short label for logs, e.g. `"gpio:gpiochip0"`.
    fn name(&self) -> &str;

    /// Produce the next raw event, or `Ok(None)` once `timeout` elapses.
    ///
    /// Implementations must return within roughly `timeout` so the pipeline can keep
    /// its classifier timers running.
    fn sample(&mut self, timeout: Duration) -> Result<Option<RawEvent>, SampleError>;

    /// Try to reopen the underlying device after [`SampleError::Unavailable`].
    fn recover(&mut self) -> Result<(), SampleError> {
        Ok(())
    }
}
