//! In-memory sampler for tests and dry runs.
//!
//! A [`VirtualSampler`] is driven from another thread through its
//! [`VirtualHandle`]: inject raw readings, garbage or a disconnect and the
//! pipeline sees exactly what a real device would have produced.

use crate::device::{SampleError, Sampler};
use crate::event::{Code, RawEvent, RawState, SourceKind};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
enum Scripted {
    Event(RawEvent),
    Malformed(String),
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Scripted>,
    disconnected: bool,
    recoveries: u32,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    fed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct VirtualSampler {
    source: SourceKind,
    name: String,
    shared: Arc<Shared>,
}

/// Feeds a [`VirtualSampler`]. Cheap to clone.
#[derive(Clone)]
pub struct VirtualHandle {
    source: SourceKind,
    shared: Arc<Shared>,
}

impl VirtualSampler {
    pub fn new(source: SourceKind) -> (Self, VirtualHandle) {
        let shared = Arc::new(Shared::default());
        let sampler = Self {
            source,
            name: format!("virtual:{source}"),
            shared: Arc::clone(&shared),
        };
        (sampler, VirtualHandle { source, shared })
    }
}

impl Sampler for VirtualSampler {
    fn source(&self) -> SourceKind {
        self.source
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self, timeout: Duration) -> Result<Option<RawEvent>, SampleError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.disconnected {
                return Err(SampleError::Unavailable("virtual device unplugged".into()));
            }
            match state.queue.pop_front() {
                Some(Scripted::Event(raw)) => return Ok(Some(raw)),
                Some(Scripted::Malformed(reason)) => return Err(SampleError::Malformed(reason)),
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .shared
                .fed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn recover(&mut self) -> Result<(), SampleError> {
        let mut state = self.shared.lock();
        if state.disconnected {
            Err(SampleError::Unavailable("virtual device still unplugged".into()))
        } else {
            state.recoveries += 1;
            Ok(())
        }
    }
}

impl VirtualHandle {
    /// Inject a raw event. Its source is forced to the sampler's.
    pub fn feed(&self, mut raw: RawEvent) {
        raw.source = self.source;
        self.push(Scripted::Event(raw));
    }

    /// Convenience: a pin level captured now.
    pub fn set_pin(&self, pin: u32, level: bool) {
        self.feed_state(Code::Pin(pin), RawState::Level(level));
    }

    /// Convenience: an electrode reading captured now.
    pub fn set_pad(&self, pad: u8, reading: u16) {
        self.feed_state(Code::Pad(pad), RawState::Capacitance(reading));
    }

    /// Convenience: an IR frame received now.
    pub fn ir_frame(&self, button: &str, repeat: u32) {
        self.feed_state(Code::Ir(button.to_string()), RawState::IrCode { repeat });
    }

    fn feed_state(&self, code: Code, state: RawState) {
        self.feed(RawEvent {
            source: self.source,
            code,
            state,
            at: Instant::now(),
        });
    }

    pub fn feed_malformed(&self, reason: &str) {
        self.push(Scripted::Malformed(reason.to_string()));
    }

    /// Make the device unreachable until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.shared.lock().disconnected = true;
        self.shared.fed.notify_all();
    }

    pub fn reconnect(&self) {
        self.shared.lock().disconnected = false;
        self.shared.fed.notify_all();
    }

    /// Successful [`Sampler::recover`] calls so far.
    pub fn recoveries(&self) -> u32 {
        self.shared.lock().recoveries
    }

    /// Scripted items not yet sampled.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    fn push(&self, item: Scripted) {
        self.shared.lock().queue.push_back(item);
        self.shared.fed.notify_all();
    }
}
