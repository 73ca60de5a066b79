//! Press classification.
//!
//! Each held key runs a small state machine:
//!
//! ```text
//! Idle --press--> Pressed --release (< long press)--> Idle        emits short_release
//!                 Pressed --long press elapses------> Held        emits long_hold (once)
//!                 Held    --repeat interval---------> Held        emits repeat
//!                 Held    --release-----------------> Idle        emits nothing
//! ```
//!
//! A classifier belongs to exactly one source pipeline, so instances are keyed by
//! `(LogicalKey, source)` implicitly: the same key held on two sources runs two
//! independent machines.
//!
//! Time only advances through the `at`/`now` arguments; the classifier never reads
//! the clock itself. `long_hold` and `repeat` are stamped with their scheduled
//! instants, so late ticks catch up without drifting.

use crate::event::{ActionKind, ClassifiedEvent, SourceKind};
use crate::key::LogicalKey;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

pub const DEFAULT_LONG_PRESS: Duration = Duration::from_millis(800);
pub const DEFAULT_REPEAT: Duration = Duration::from_millis(400);

/// Long-press and repeat thresholds of one key. `None` disables the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub long_press: Option<Duration>,
    pub repeat: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            long_press: Some(DEFAULT_LONG_PRESS),
            repeat: Some(DEFAULT_REPEAT),
        }
    }
}

impl Timing {
    /// Build from millisecond settings where `0` means "disabled".
    pub fn from_millis(long_press_ms: u64, repeat_ms: u64) -> Self {
        let opt = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            long_press: opt(long_press_ms),
            repeat: opt(repeat_ms),
        }
    }
}

/// Source-level default plus per-key overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingTable {
    pub default: Timing,
    pub per_key: HashMap<LogicalKey, Timing>,
}

impl TimingTable {
    pub fn new(default: Timing) -> Self {
        Self {
            default,
            per_key: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: LogicalKey, timing: Timing) -> Self {
        self.per_key.insert(key, timing);
        self
    }

    pub fn get(&self, key: &LogicalKey) -> Timing {
        self.per_key.get(key).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PressState {
    Pressed { since: Instant },
    Held { since: Instant, next_repeat: Option<Instant> },
}

impl PressState {
    fn since(&self) -> Instant {
        match *self {
            PressState::Pressed { since } | PressState::Held { since, .. } => since,
        }
    }
}

/// Per-source press classifier.
#[derive(Debug, Clone)]
pub struct PressClassifier {
    source: SourceKind,
    timings: TimingTable,
    active: BTreeMap<LogicalKey, PressState>,
}

impl PressClassifier {
    pub fn new(source: SourceKind, timings: TimingTable) -> Self {
        Self {
            source,
            timings,
            active: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Feed a debounced transition for a resolved key.
    pub fn handle(
        &mut self,
        key: LogicalKey,
        pressed: bool,
        at: Instant,
        out: &mut Vec<ClassifiedEvent>,
    ) {
        if pressed {
            self.press(key, at, out);
        } else {
            self.release(&key, at, out);
        }
    }

    pub fn press(&mut self, key: LogicalKey, at: Instant, out: &mut Vec<ClassifiedEvent>) {
        if self.active.contains_key(&key) {
            return;
        }
        out.push(self.event(&key, ActionKind::Press, at));
        self.active.insert(key, PressState::Pressed { since: at });
    }

    pub fn release(&mut self, key: &LogicalKey, at: Instant, out: &mut Vec<ClassifiedEvent>) {
        // A release at or past a deadline first fires what was due.
        self.advance(key, at, out);
        match self.active.remove(key) {
            Some(PressState::Pressed { .. }) => {
                out.push(self.event(key, ActionKind::ShortRelease, at));
            }
            Some(PressState::Held { .. }) | None => {}
        }
    }

    /// Emit every `long_hold`/`repeat` due by `now`, in timestamp order.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<ClassifiedEvent>) {
        let start = out.len();
        let keys: Vec<LogicalKey> = self.active.keys().cloned().collect();
        for key in &keys {
            self.advance(key, now, out);
        }
        out[start..].sort_by_key(|e| e.at);
    }

    fn advance(&mut self, key: &LogicalKey, now: Instant, out: &mut Vec<ClassifiedEvent>) {
        let timing = self.timings.get(key);
        loop {
            let Some(state) = self.active.get(key).copied() else {
                return;
            };
            match state {
                PressState::Pressed { since } => {
                    let Some(long_press) = timing.long_press else {
                        return;
                    };
                    let due = since + long_press;
                    if now < due {
                        return;
                    }
                    out.push(self.event(key, ActionKind::LongHold, due));
                    let next_repeat = timing.repeat.map(|r| due + r);
                    self.active
                        .insert(key.clone(), PressState::Held { since, next_repeat });
                }
                PressState::Held {
                    since,
                    next_repeat: Some(due),
                } => {
                    if now < due {
                        return;
                    }
                    out.push(self.event(key, ActionKind::Repeat, due));
                    let next_repeat = timing.repeat.map(|r| due + r);
                    self.active
                        .insert(key.clone(), PressState::Held { since, next_repeat });
                }
                PressState::Held {
                    next_repeat: None, ..
                } => return,
            }
        }
    }

    /// Drop every in-flight press without emitting anything.
    pub fn reset(&mut self) {
        self.active.clear();
    }

    /// Swap thresholds; in-flight presses are dropped since their deadlines
    /// were computed from the old table.
    pub fn set_timings(&mut self, timings: TimingTable) {
        self.timings = timings;
        self.reset();
    }

    /// Keys currently down, with the instant they went down.
    pub fn held(&self) -> Vec<(LogicalKey, Instant)> {
        self.active
            .iter()
            .map(|(k, s)| (k.clone(), s.since()))
            .collect()
    }

    fn event(&self, key: &LogicalKey, action: ActionKind, at: Instant) -> ClassifiedEvent {
        ClassifiedEvent {
            key: key.clone(),
            action,
            at,
            source: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn key(name: &str) -> LogicalKey {
        LogicalKey::new(name).unwrap()
    }

    fn classifier() -> PressClassifier {
        PressClassifier::new(
            SourceKind::Gpio,
            TimingTable::new(Timing::from_millis(800, 400)),
        )
    }

    fn actions(events: &[ClassifiedEvent], t0: Instant) -> Vec<(ActionKind, u64)> {
        events
            .iter()
            .map(|e| (e.action, (e.at - t0).as_millis() as u64))
            .collect()
    }

    #[test]
    fn hold_three_seconds_emits_long_hold_then_repeats() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut out = Vec::new();

        c.press(key("KEY_LEFT"), t0, &mut out);
        for step in 1..300 {
            c.tick(t0 + ms(step * 10), &mut out);
        }
        c.release(&key("KEY_LEFT"), t0 + ms(3000), &mut out);

        assert_eq!(
            actions(&out, t0),
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
    }

    #[test]
    fn release_before_threshold_is_one_short_release() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut out = Vec::new();

        c.press(key("KEY_OK"), t0, &mut out);
        c.tick(t0 + ms(500), &mut out);
        c.tick(t0 + ms(799), &mut out);
        c.release(&key("KEY_OK"), t0 + ms(799), &mut out);
        c.tick(t0 + ms(2000), &mut out);

        assert_eq!(
            actions(&out, t0),
            vec![(ActionKind::Press, 0), (ActionKind::ShortRelease, 799)]
        );
    }

    #[test]
    fn long_hold_fires_once_at_boundary() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut out = Vec::new();

        c.press(key("KEY_OK"), t0, &mut out);
        c.tick(t0 + ms(800), &mut out);
        c.tick(t0 + ms(800), &mut out);
        c.release(&key("KEY_OK"), t0 + ms(800), &mut out);

        assert_eq!(
            actions(&out, t0),
            vec![(ActionKind::Press, 0), (ActionKind::LongHold, 800)]
        );

        // Released exactly at the threshold with no tick in between.
        out.clear();
        c.press(key("KEY_OK"), t0, &mut out);
        c.release(&key("KEY_OK"), t0 + ms(800), &mut out);
        assert_eq!(
            actions(&out, t0),
            vec![(ActionKind::Press, 0), (ActionKind::LongHold, 800)]
        );
    }

    #[test]
    fn late_tick_catches_up_missed_repeats() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut out = Vec::new();

        c.press(key("KEY_UP"), t0, &mut out);
        c.tick(t0 + ms(1700), &mut out);
        assert_eq!(
            actions(&out, t0),
            vec![
                (ActionKind::Press, 0),
                (ActionKind::LongHold, 800),
                (ActionKind::Repeat, 1200),
                (ActionKind::Repeat, 1600),
            ]
        );
    }

    #[test]
    fn per_key_override_and_disabled_stages() {
        let t0 = Instant::now();
        let table = TimingTable::new(Timing::from_millis(800, 400))
            .with_key(key("KEY_POWER"), Timing::from_millis(2000, 0))
            .with_key(key("KEY_VOLUMEUP"), Timing::from_millis(0, 0));
        let mut c = PressClassifier::new(SourceKind::Ir, table);
        let mut out = Vec::new();

        c.press(key("KEY_POWER"), t0, &mut out);
        c.press(key("KEY_VOLUMEUP"), t0, &mut out);
        c.tick(t0 + ms(1500), &mut out);
        assert_eq!(out.len(), 2);

        c.tick(t0 + ms(4000), &mut out);
        c.release(&key("KEY_VOLUMEUP"), t0 + ms(4000), &mut out);
        c.release(&key("KEY_POWER"), t0 + ms(4000), &mut out);
        let tail: Vec<_> = out[2..].iter().map(|e| (e.key.to_string(), e.action)).collect();
        assert_eq!(
            tail,
            vec![
                ("KEY_POWER".to_string(), ActionKind::LongHold),
                ("KEY_VOLUMEUP".to_string(), ActionKind::ShortRelease),
            ]
        );
    }

    #[test]
    fn duplicate_press_and_stray_release_are_ignored() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut out = Vec::new();

        c.release(&key("KEY_OK"), t0, &mut out);
        c.press(key("KEY_OK"), t0, &mut out);
        c.press(key("KEY_OK"), t0 + ms(10), &mut out);
        assert_eq!(actions(&out, t0), vec![(ActionKind::Press, 0)]);
    }

    #[test]
    fn reset_returns_to_idle_silently() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut out = Vec::new();

        c.press(key("KEY_LEFT"), t0, &mut out);
        c.reset();
        c.tick(t0 + ms(5000), &mut out);
        c.release(&key("KEY_LEFT"), t0 + ms(5000), &mut out);
        assert_eq!(out.len(), 1);
        assert!(c.held().is_empty());
    }
}
