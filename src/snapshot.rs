//! Point-in-time diagnostics.
//!
//! [`Snapshot`] is an **owned**, read-only view of the input subsystem produced by
//! [`InputManager::snapshot`](crate::manager::InputManager::snapshot). It never
//! touches the devices; every value is what the pipelines last reported.
//!
//! # Semantics
//! - `dropped` and `published` are lifetime counters of the shared publisher.
//! - One [`SourceStatus`] per running pipeline, in [`SourceKind`] order.
//! - `held` durations are measured at the time the snapshot was taken.
//!
//! ```no_run
//! use keyrelay::Snapshot;
//!
//! fn report(snap: &Snapshot) {
//!     for status in snap.iter() {
//!         println!("{}: degraded={} held={}", status.source, status.degraded, status.held.len());
//!     }
//! }
//! ```

use crate::event::SourceKind;
use crate::key::LogicalKey;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A key that is down right now.
#[derive(Clone, Debug, PartialEq)]
pub struct HeldKey {
    pub key: LogicalKey,
    pub held_for: Duration,
}

/// Live state of one source pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceStatus {
    pub source: SourceKind,
    /// Sampler label, e.g. `"ir:/var/run/lirc/lircd"`.
    pub device: String,
    /// The device is unreachable and the pipeline is retrying.
    pub degraded: bool,
    /// Raw signals dropped as malformed since startup.
    pub malformed: u64,
    pub held: Vec<HeldKey>,
    /// Touch baselines per pad (empty for other sources).
    pub baselines: BTreeMap<u8, f32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub dropped: u64,
    pub published: u64,
    pub sources: Vec<SourceStatus>,
}

impl Snapshot {
    #[inline]
    pub fn get(&self, source: SourceKind) -> Option<&SourceStatus> {
        self.sources.iter().find(|s| s.source == source)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &SourceStatus> {
        self.sources.iter()
    }

    pub fn degraded(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.sources.iter().filter(|s| s.degraded).map(|s| s.source)
    }

    /// Compares the fields worth logging: counters and health, not hold durations
    /// or baselines, which change on every sample.
    pub fn summary_differs(&self, other: &Snapshot) -> bool {
        let summary = |s: &Snapshot| {
            (
                s.dropped,
                s.sources
                    .iter()
                    .map(|st| {
                        (
                            st.source,
                            st.degraded,
                            st.malformed,
                            st.held.iter().map(|h| h.key.clone()).collect::<Vec<_>>(),
                        )
                    })
                    .collect::<Vec<_>>(),
            )
        };
        summary(self) != summary(other)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dropped={} published={}", self.dropped, self.published)?;
        for s in &self.sources {
            let state = if s.degraded { "degraded" } else { "running" };
            write!(f, " | {} {} malformed={}", s.source, state, s.malformed)?;
            if !s.held.is_empty() {
                let keys: Vec<&str> = s.held.iter().map(|h| h.key.as_str()).collect();
                write!(f, " held=[{}]", keys.join(","))?;
            }
        }
        Ok(())
    }
}
