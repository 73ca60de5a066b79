//! Per-source pipeline.
//!
//! ```text
//! Sampler -> Filter -> [GestureRecognizer, touch only] -> KeyMap -> PressClassifier -> Publisher
//! ```
//!
//! A pipeline owns every stage of one source and runs on its own thread. Nothing
//! in it is shared with other sources except the [`Publisher`] and the read-only
//! [`KeyMap`]; diagnostics are exported through [`SourceHealth`].

use crate::binding::KeyMap;
use crate::classifier::{PressClassifier, TimingTable};
use crate::config::Config;
use crate::debounce::{Filter, IrRepeatFilter, PinDebouncer, RotaryDecoder, TouchFilter};
use crate::device::{SampleError, Sampler};
use crate::error::ConfigError;
use crate::event::{ActionKind, ClassifiedEvent, DebouncedEvent, RawEvent, SourceKind};
use crate::eventbus::Publisher;
use crate::gesture::{GestureOutput, GestureRecognizer};
use crate::key::LogicalKey;
use crate::snapshot::{HeldKey, SourceStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound on how long a sampler may block before timers are serviced.
pub const TICK: Duration = Duration::from_millis(10);

pub const BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Everything a pipeline needs that comes from configuration.
pub struct SourceSetup {
    pub source: SourceKind,
    pub keymap: Arc<KeyMap>,
    pub timings: TimingTable,
    pub filter: Box<dyn Filter>,
    pub gestures: Option<GestureRecognizer>,
}

impl SourceSetup {
    pub fn new(
        source: SourceKind,
        keymap: Arc<KeyMap>,
        timings: TimingTable,
        filter: Box<dyn Filter>,
    ) -> Self {
        Self {
            source,
            keymap,
            timings,
            filter,
            gestures: None,
        }
    }

    pub fn with_gestures(mut self, gestures: GestureRecognizer) -> Self {
        self.gestures = (!gestures.is_empty()).then_some(gestures);
        self
    }

    /// Build the setup of `source` from a validated configuration.
    pub fn from_config(
        config: &Config,
        source: SourceKind,
        keymap: Arc<KeyMap>,
    ) -> Result<Self, ConfigError> {
        let ms = Duration::from_millis;
        let filter: Box<dyn Filter> = match source {
            SourceKind::Gpio => {
                let mut debouncer = PinDebouncer::buttons(ms(config.sources.gpio.debounce_ms));
                for (pin, window) in config.gpio_debounce_overrides() {
                    debouncer = debouncer.with_window(pin, window);
                }
                Box::new(debouncer)
            }
            SourceKind::Rotary => Box::new(RotaryDecoder::new(
                config.encoders(),
                ms(config.sources.rotary.debounce_ms),
            )),
            SourceKind::Touch => {
                let (defaults, overrides) = config.pad_thresholds()?;
                Box::new(TouchFilter::new(defaults, overrides))
            }
            SourceKind::Ir => Box::new(IrRepeatFilter::new(
                ms(config.sources.ir.repeat_gap_ms),
                ms(config.sources.ir.release_ms),
            )),
        };

        let setup = Self::new(source, keymap, config.timings(source), filter);
        if source == SourceKind::Touch {
            let gestures = GestureRecognizer::new(config.gestures()?, config.gesture_window());
            Ok(setup.with_gestures(gestures))
        } else {
            Ok(setup)
        }
    }
}

/// Messages from the manager to a running pipeline.
pub enum Control {
    Reload(Box<SourceSetup>),
    Shutdown,
}

#[derive(Debug, Default)]
struct LiveState {
    held: Vec<(LogicalKey, Instant)>,
    baselines: BTreeMap<u8, f32>,
}

/// Diagnostics a pipeline exports while it runs.
#[derive(Debug)]
pub struct SourceHealth {
    source: SourceKind,
    device: String,
    degraded: AtomicBool,
    malformed: AtomicU64,
    live: Mutex<LiveState>,
}

impl SourceHealth {
    pub fn new(source: SourceKind, device: impl Into<String>) -> Self {
        Self {
            source,
            device: device.into(),
            degraded: AtomicBool::new(false),
            malformed: AtomicU64::new(0),
            live: Mutex::new(LiveState::default()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn status(&self, now: Instant) -> SourceStatus {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        SourceStatus {
            source: self.source,
            device: self.device.clone(),
            degraded: self.is_degraded(),
            malformed: self.malformed(),
            held: live
                .held
                .iter()
                .map(|(key, since)| HeldKey {
                    key: key.clone(),
                    held_for: now.saturating_duration_since(*since),
                })
                .collect(),
            baselines: live.baselines.clone(),
        }
    }

    fn set_live(&self, held: Vec<(LogicalKey, Instant)>, baselines: BTreeMap<u8, f32>) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.held = held;
        live.baselines = baselines;
    }
}

/// Exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_MIN, BACKOFF_MAX)
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            next: min,
        }
    }

    /// Delay before the next attempt; doubles up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

pub struct Pipeline {
    source: SourceKind,
    keymap: Arc<KeyMap>,
    filter: Box<dyn Filter>,
    gestures: Option<GestureRecognizer>,
    classifier: PressClassifier,
    publisher: Arc<Publisher>,
    health: Arc<SourceHealth>,
    debounced: Vec<DebouncedEvent>,
    routed: Vec<GestureOutput>,
    classified: Vec<ClassifiedEvent>,
    /// Held keys may have changed since the last export.
    dirty: bool,
}

impl Pipeline {
    pub fn new(setup: SourceSetup, publisher: Arc<Publisher>, health: Arc<SourceHealth>) -> Self {
        let SourceSetup {
            source,
            keymap,
            timings,
            filter,
            gestures,
        } = setup;
        Self {
            source,
            keymap,
            filter,
            gestures,
            classifier: PressClassifier::new(source, timings),
            publisher,
            health,
            debounced: Vec::new(),
            routed: Vec::new(),
            classified: Vec::new(),
            dirty: false,
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Swap in a new configuration. Every stage returns to idle; nothing is emitted
    /// for keys that were down.
    pub fn apply(&mut self, setup: SourceSetup) {
        if setup.source != self.source {
            warn!(
                source = %self.source,
                got = %setup.source,
                "ignoring setup for another source"
            );
            return;
        }
        self.keymap = setup.keymap;
        self.filter = setup.filter;
        self.gestures = setup.gestures;
        self.classifier.set_timings(setup.timings);
        self.reset();
        info!(source = %self.source, bindings = self.keymap.bindings(self.source).count(), "bindings reloaded");
    }

    /// Drop all in-flight state without emitting anything.
    pub fn reset(&mut self) {
        self.filter.reset();
        if let Some(g) = self.gestures.as_mut() {
            g.reset();
        }
        self.classifier.reset();
        self.debounced.clear();
        self.routed.clear();
        self.classified.clear();
        self.export();
    }

    /// Run one raw sample through the stages and publish what comes out.
    pub fn process(&mut self, raw: &RawEvent) {
        self.advance(raw.at);
        self.filter.feed(raw, &mut self.debounced);
        self.route();
        self.flush();
    }

    /// Service timers: pending debounce windows, expired gesture buffers,
    /// long-press and repeat deadlines.
    pub fn tick(&mut self, now: Instant) {
        self.advance(now);
        self.flush();
    }

    fn advance(&mut self, now: Instant) {
        self.filter.poll(now, &mut self.debounced);
        self.route();
        if let Some(g) = self.gestures.as_mut() {
            g.poll(now, &mut self.routed);
        }
        self.classify();
        self.classifier.tick(now, &mut self.classified);
    }

    fn route(&mut self) {
        for event in self.debounced.drain(..) {
            match self.gestures.as_mut() {
                Some(g) => g.push(event, &mut self.routed),
                None => self.routed.push(GestureOutput::Pad(event)),
            }
        }
        self.classify();
    }

    fn classify(&mut self) {
        self.dirty |= !self.routed.is_empty();
        for output in self.routed.drain(..) {
            match output {
                GestureOutput::Pad(event) => {
                    let Some(key) = self.keymap.resolve(self.source, &event.code) else {
                        trace!(source = %self.source, code = %event.code, "unbound code");
                        continue;
                    };
                    self.classifier
                        .handle(key.clone(), event.pressed, event.at, &mut self.classified);
                }
                GestureOutput::Gesture { key, at } => {
                    for action in [ActionKind::Press, ActionKind::ShortRelease] {
                        self.classified.push(ClassifiedEvent {
                            key: key.clone(),
                            action,
                            at,
                            source: self.source,
                        });
                    }
                }
            }
        }
    }

    fn flush(&mut self) {
        // Touch baselines move with every sample.
        let export = self.dirty || !self.classified.is_empty() || self.source == SourceKind::Touch;
        for event in &self.classified {
            trace!(key = %event.key, action = ?event.action, "classified");
        }
        self.publisher.publish_all(self.classified.drain(..));
        if export {
            self.export();
        }
    }

    fn export(&mut self) {
        self.dirty = false;
        self.health
            .set_live(self.classifier.held(), self.filter.baselines());
    }

    /// Sampling loop. Returns when told to shut down or when the control channel
    /// closes.
    pub fn run(mut self, mut sampler: Box<dyn Sampler>, control: Receiver<Control>) {
        info!(source = %self.source, device = sampler.name(), "pipeline started");
        // Present while the device is unreachable; kept across retries so the delay
        // keeps growing until a sample succeeds.
        let mut outage: Option<Backoff> = None;
        loop {
            match control.try_recv() {
                Ok(Control::Reload(setup)) => self.apply(*setup),
                Ok(Control::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match sampler.sample(TICK) {
                Ok(raw) => {
                    self.end_outage(sampler.as_ref(), &mut outage);
                    if let Some(raw) = raw {
                        self.process(&raw);
                    }
                }
                Err(SampleError::Malformed(reason)) => {
                    self.end_outage(sampler.as_ref(), &mut outage);
                    self.health.malformed.fetch_add(1, Ordering::Relaxed);
                    trace!(source = %self.source, %reason, "dropped malformed input");
                }
                Err(SampleError::Unavailable(reason)) => {
                    let backoff = outage.get_or_insert_with(|| {
                        warn!(
                            source = %self.source,
                            device = sampler.name(),
                            %reason,
                            "source degraded, retrying"
                        );
                        self.reset();
                        self.health.degraded.store(true, Ordering::Relaxed);
                        Backoff::default()
                    });
                    if !self.retry(sampler.as_mut(), backoff, &control) {
                        break;
                    }
                }
            }
            self.tick(Instant::now());
        }
        info!(source = %self.source, "pipeline stopped");
    }

    fn end_outage(&mut self, sampler: &dyn Sampler, outage: &mut Option<Backoff>) {
        if outage.take().is_some() {
            self.health.degraded.store(false, Ordering::Relaxed);
            info!(source = %self.source, device = sampler.name(), "source recovered");
        }
    }

    /// Wait out the next backoff delay, then retry until `recover` succeeds. The
    /// outage only ends once a sample goes through. Returns `false` if shutdown was
    /// requested meanwhile.
    fn retry(
        &mut self,
        sampler: &mut dyn Sampler,
        backoff: &mut Backoff,
        control: &Receiver<Control>,
    ) -> bool {
        loop {
            match control.recv_timeout(backoff.next_delay()) {
                Ok(Control::Reload(setup)) => self.apply(*setup),
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                Err(RecvTimeoutError::Timeout) => {}
            }
            match sampler.recover() {
                Ok(()) => return true,
                Err(e) => debug!(source = %self.source, error = %e, "recovery attempt failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::PhysicalBinding;
    use crate::classifier::Timing;
    use crate::event::{Code, RawState};
    use crate::eventbus::{PublisherConfig, TieBreak};
    use crate::gesture::{Gesture, GesturePattern};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn key(name: &str) -> LogicalKey {
        LogicalKey::new(name).unwrap()
    }

    fn publisher() -> Arc<Publisher> {
        Arc::new(Publisher::new(PublisherConfig {
            queue_depth: 256,
            tie_break: TieBreak::default(),
            reorder_window: Duration::ZERO,
        }))
    }

    fn keymap(bindings: &[(SourceKind, Code, &str)]) -> Arc<KeyMap> {
        let map = KeyMap::from_bindings(
            bindings
                .iter()
                .map(|(s, c, k)| PhysicalBinding::new(*s, c.clone(), key(k))),
        )
        .unwrap();
        Arc::new(map)
    }

    fn pin(pin: u32, level: bool, at: Instant) -> RawEvent {
        RawEvent {
            source: SourceKind::Gpio,
            code: Code::Pin(pin),
            state: RawState::Level(level),
            at,
        }
    }

    fn gpio_pipeline(publisher: &Arc<Publisher>) -> (Pipeline, Arc<SourceHealth>) {
        let setup = SourceSetup::new(
            SourceKind::Gpio,
            keymap(&[(SourceKind::Gpio, Code::Pin(17), "KEY_LEFT")]),
            TimingTable::new(Timing::from_millis(800, 400)),
            Box::new(PinDebouncer::buttons(ms(30))),
        );
        let health = Arc::new(SourceHealth::new(SourceKind::Gpio, "gpio:test"));
        (
            Pipeline::new(setup, Arc::clone(publisher), Arc::clone(&health)),
            health,
        )
    }

    fn actions(events: &[ClassifiedEvent], t0: Instant) -> Vec<(ActionKind, u64)> {
        events
            .iter()
            .map(|e| (e.action, (e.at - t0).as_millis() as u64))
            .collect()
    }

    #[test]
    fn gpio_hold_three_seconds() {
        let t0 = Instant::now();
        let publisher = publisher();
        let (mut p, health) = gpio_pipeline(&publisher);

        p.process(&pin(17, true, t0));
        for step in 1..=300 {
            p.tick(t0 + ms(step * 10));
        }
        assert_eq!(health.status(t0 + ms(3000)).held.len(), 1);
        p.process(&pin(17, false, t0 + ms(3000)));
        p.tick(t0 + ms(3100));

        // Debounce shifts everything by the 30 ms window.
        assert_eq!(
            actions(&publisher.take_all(), t0 + ms(30)),
            vec![
                (ActionKind::Press, 0),
                (ActionKind::LongHold, 800),
                (ActionKind::Repeat, 1200),
                (ActionKind::Repeat, 1600),
                (ActionKind::Repeat, 2000),
                (ActionKind::Repeat, 2400),
                (ActionKind::Repeat, 2800),
            ]
        );
        assert!(health.status(t0 + ms(3100)).held.is_empty());
    }

    #[test]
    fn bounce_and_unbound_pins_emit_nothing() {
        let t0 = Instant::now();
        let publisher = publisher();
        let (mut p, _) = gpio_pipeline(&publisher);

        p.process(&pin(17, true, t0));
        p.process(&pin(17, false, t0 + ms(5)));
        p.process(&pin(22, true, t0 + ms(6)));
        p.tick(t0 + ms(200));
        assert!(publisher.is_empty());
    }

    #[test]
    fn reload_resets_held_keys_and_swaps_bindings() {
        let t0 = Instant::now();
        let publisher = publisher();
        let (mut p, health) = gpio_pipeline(&publisher);

        p.process(&pin(17, true, t0));
        p.tick(t0 + ms(40));
        assert_eq!(publisher.take_all().len(), 1);

        p.apply(SourceSetup::new(
            SourceKind::Gpio,
            keymap(&[(SourceKind::Gpio, Code::Pin(17), "KEY_BACK")]),
            TimingTable::new(Timing::from_millis(800, 400)),
            Box::new(PinDebouncer::buttons(ms(30))),
        ));
        assert!(health.status(t0 + ms(40)).held.is_empty());

        // No long_hold for the stale press, even far past the old deadline.
        p.tick(t0 + ms(2000));
        assert!(publisher.is_empty());

        p.process(&pin(17, false, t0 + ms(2100)));
        p.process(&pin(17, true, t0 + ms(2200)));
        p.process(&pin(17, false, t0 + ms(2400)));
        p.tick(t0 + ms(2500));
        let out = publisher.take_all();
        let keys: Vec<_> = out.iter().map(|e| (e.key.to_string(), e.action)).collect();
        assert_eq!(
            keys,
            vec![
                ("KEY_BACK".to_string(), ActionKind::Press),
                ("KEY_BACK".to_string(), ActionKind::ShortRelease),
            ]
        );
    }

    #[test]
    fn touch_swipe_publishes_gesture_tap_only() {
        let t0 = Instant::now();
        let publisher = publisher();
        let setup = SourceSetup::new(
            SourceKind::Touch,
            keymap(&[
                (SourceKind::Touch, Code::Pad(0), "KEY_PLAY"),
                (SourceKind::Touch, Code::Pad(1), "KEY_STOP"),
                (SourceKind::Touch, Code::Pad(2), "KEY_MUTE"),
            ]),
            TimingTable::default(),
            Box::new(TouchFilter::new(Default::default(), Default::default())),
        )
        .with_gestures(GestureRecognizer::new(
            vec![Gesture {
                pattern: GesturePattern::Swipe {
                    pads: vec![0, 1, 2],
                },
                key: key("KEY_NEXT"),
            }],
            ms(200),
        ));
        let health = Arc::new(SourceHealth::new(SourceKind::Touch, "touch:test"));
        let mut p = Pipeline::new(setup, Arc::clone(&publisher), Arc::clone(&health));

        let sample = |pad: u8, value: u16, at: Instant| RawEvent {
            source: SourceKind::Touch,
            code: Code::Pad(pad),
            state: RawState::Capacitance(value),
            at,
        };
        for pad in 0..3 {
            p.process(&sample(pad, 500, t0));
        }
        p.process(&sample(0, 450, t0 + ms(20)));
        p.process(&sample(1, 450, t0 + ms(90)));
        p.process(&sample(2, 450, t0 + ms(170)));
        for pad in 0..3 {
            p.process(&sample(pad, 500, t0 + ms(260)));
        }
        p.tick(t0 + ms(1000));

        let out = publisher.take_all();
        assert_eq!(
            out.iter().map(|e| (e.key.to_string(), e.action)).collect::<Vec<_>>(),
            vec![
                ("KEY_NEXT".to_string(), ActionKind::Press),
                ("KEY_NEXT".to_string(), ActionKind::ShortRelease),
            ]
        );
        assert_eq!(health.status(t0).baselines.len(), 3);
    }

    /// Reachable as far as `recover` can tell, but every read fails.
    struct BrokenLine {
        attempts: Arc<AtomicU64>,
    }

    impl Sampler for BrokenLine {
        fn source(&self) -> SourceKind {
            SourceKind::Gpio
        }

        fn name(&self) -> &str {
            "gpio:broken"
        }

        fn sample(&mut self, _timeout: Duration) -> Result<Option<RawEvent>, SampleError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SampleError::Unavailable("line read failed".into()))
        }

        fn recover(&mut self) -> Result<(), SampleError> {
            Ok(())
        }
    }

    #[test]
    fn persistent_failure_backs_off_and_stays_degraded() {
        let publisher = publisher();
        let (p, health) = gpio_pipeline(&publisher);
        let attempts = Arc::new(AtomicU64::new(0));
        let (control, rx) = std::sync::mpsc::channel();
        let sampler = Box::new(BrokenLine {
            attempts: Arc::clone(&attempts),
        });
        let thread = std::thread::spawn(move || p.run(sampler, rx));

        // Retries at 100, 300, 700 and 1500 ms after the first failure.
        std::thread::sleep(ms(1200));
        assert!(health.is_degraded());
        control.send(Control::Shutdown).unwrap();
        thread.join().unwrap();

        let n = attempts.load(Ordering::SeqCst);
        assert!((2..=5).contains(&n), "{n} attempts");
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = Backoff::default();
        let delays: Vec<_> = (0..8).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
        b.reset();
        assert_eq!(b.next_delay(), BACKOFF_MIN);
    }
}
