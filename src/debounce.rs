//! Debounce and filter stage.
//!
//! Every source gets its own [`Filter`], tuned to its noise characteristics:
//!
//! | Source | Filter | Criterion |
//! |---|---|---|
//! | GPIO buttons | [`PinDebouncer`] | level stable for the debounce window |
//! | rotary | [`RotaryDecoder`] | per-line debounce, then quadrature decoding |
//! | IR | [`IrRepeatFilter`] | repeat frames inside the gap keep the key held |
//! | touch | [`TouchFilter`] | delta against a rolling baseline, with hysteresis |
//!
//! Filters are driven both by incoming raw events ([`Filter::feed`]) and by time
//! ([`Filter::poll`]); a pending transition is only emitted once its window has
//! elapsed, stamped with the time it became stable.

use crate::event::{Code, DebouncedEvent, Direction, RawEvent, RawState, SourceKind};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::trace;

pub trait Filter: Send {
    /// Accept one raw event, pushing any transition it completes.
    fn feed(&mut self, raw: &RawEvent, out: &mut Vec<DebouncedEvent>);

    /// Emit transitions whose stability window has elapsed by `now`.
    fn poll(&mut self, now: Instant, out: &mut Vec<DebouncedEvent>);

    /// Forget all in-flight state.
    fn reset(&mut self);

    /// Rolling per-pad baselines, for filters that track them.
    fn baselines(&self) -> BTreeMap<u8, f32> {
        BTreeMap::new()
    }
}

#[derive(Debug, Clone, Default)]
struct PinState {
    /// `None` until the first sample seeds the line.
    stable: Option<bool>,
    candidate: Option<(bool, Instant)>,
}

/// Stability-window debouncer for a set of GPIO lines.
///
/// A line's new level is accepted only after it has held for the line's window;
/// bouncing back to the stable level before that cancels the transition.
#[derive(Debug, Clone)]
pub struct PinDebouncer {
    source: SourceKind,
    default_window: Duration,
    windows: HashMap<u32, Duration>,
    /// Level assumed before the first sample; `None` seeds silently from it.
    initial: Option<bool>,
    pins: BTreeMap<u32, PinState>,
}

impl PinDebouncer {
    /// Debouncer for push buttons: lines start released, so a button already held
    /// at startup still produces a press.
    pub fn buttons(default_window: Duration) -> Self {
        Self {
            source: SourceKind::Gpio,
            default_window,
            windows: HashMap::new(),
            initial: Some(false),
            pins: BTreeMap::new(),
        }
    }

    /// Debouncer whose lines take their first sampled level as the resting state.
    pub fn seeded(source: SourceKind, default_window: Duration) -> Self {
        Self {
            source,
            default_window,
            windows: HashMap::new(),
            initial: None,
            pins: BTreeMap::new(),
        }
    }

    /// Override the window of one line.
    pub fn with_window(mut self, pin: u32, window: Duration) -> Self {
        self.windows.insert(pin, window);
        self
    }

    /// Last accepted level of `pin`.
    pub fn stable(&self, pin: u32) -> Option<bool> {
        self.pins.get(&pin).and_then(|p| p.stable)
    }

    fn window(&self, pin: u32) -> Duration {
        self.windows.get(&pin).copied().unwrap_or(self.default_window)
    }

    fn settle(&mut self, pin: u32, now: Instant, out: &mut Vec<DebouncedEvent>) {
        let window = self.window(pin);
        let source = self.source;
        let Some(state) = self.pins.get_mut(&pin) else {
            return;
        };
        if let Some((level, since)) = state.candidate {
            if now.saturating_duration_since(since) >= window {
                state.stable = Some(level);
                state.candidate = None;
                out.push(DebouncedEvent {
                    source,
                    code: Code::Pin(pin),
                    pressed: level,
                    at: since + window,
                });
            }
        }
    }
}

impl Filter for PinDebouncer {
    fn feed(&mut self, raw: &RawEvent, out: &mut Vec<DebouncedEvent>) {
        let (Code::Pin(pin), RawState::Level(level)) = (&raw.code, &raw.state) else {
            trace!(code = %raw.code, "pin debouncer ignoring non-level event");
            return;
        };
        let (pin, level) = (*pin, *level);

        // A candidate that matured before this sample is committed first.
        self.settle(pin, raw.at, out);

        let initial = self.initial;
        let state = self.pins.entry(pin).or_insert_with(|| PinState {
            stable: initial,
            candidate: None,
        });
        match state.stable {
            None => state.stable = Some(level),
            Some(stable) if stable == level => state.candidate = None,
            Some(_) => {
                if !matches!(state.candidate, Some((l, _)) if l == level) {
                    state.candidate = Some((level, raw.at));
                }
            }
        }
        // Zero-length windows accept immediately.
        self.settle(pin, raw.at, out);
    }

    fn poll(&mut self, now: Instant, out: &mut Vec<DebouncedEvent>) {
        let pins: Vec<u32> = self
            .pins
            .iter()
            .filter(|(_, s)| s.candidate.is_some())
            .map(|(p, _)| *p)
            .collect();
        for pin in pins {
            self.settle(pin, now, out);
        }
    }

    fn reset(&mut self) {
        for state in self.pins.values_mut() {
            state.candidate = None;
            if self.initial.is_some() {
                state.stable = self.initial;
            }
        }
    }
}

/// Pins of one quadrature encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderPins {
    pub id: u8,
    pub pin_a: u32,
    pub pin_b: u32,
    /// Valid quadrature transitions per mechanical detent (commonly 4 or 2).
    pub steps_per_detent: u8,
}

/// Quadrature transition table indexed by `(prev << 2) | curr`, with `state = (a << 1) | b`.
/// A leading B counts positive (clockwise); impossible double-edge jumps count zero.
const QUADRATURE: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Debounces encoder lines and turns completed detents into taps on
/// [`Code::Step`].
#[derive(Debug, Clone)]
pub struct RotaryDecoder {
    lines: PinDebouncer,
    encoders: Vec<EncoderPins>,
    counts: Vec<i16>,
    scratch: Vec<DebouncedEvent>,
}

impl RotaryDecoder {
    pub fn new(encoders: Vec<EncoderPins>, window: Duration) -> Self {
        let counts = vec![0; encoders.len()];
        Self {
            lines: PinDebouncer::seeded(SourceKind::Rotary, window),
            encoders,
            counts,
            scratch: Vec::new(),
        }
    }

    fn decode(&mut self, out: &mut Vec<DebouncedEvent>) {
        for edge in std::mem::take(&mut self.scratch) {
            let Code::Pin(pin) = edge.code else { continue };
            let Some(idx) = self
                .encoders
                .iter()
                .position(|e| e.pin_a == pin || e.pin_b == pin)
            else {
                continue;
            };
            let enc = self.encoders[idx];
            let (Some(a), Some(b)) = (self.lines.stable(enc.pin_a), self.lines.stable(enc.pin_b))
            else {
                continue;
            };
            let curr = (u8::from(a) << 1) | u8::from(b);
            let flipped = if pin == enc.pin_a { 0b10 } else { 0b01 };
            let prev = curr ^ flipped;
            let count = &mut self.counts[idx];
            *count += i16::from(QUADRATURE[usize::from((prev << 2) | curr)]);

            let detent = i16::from(enc.steps_per_detent.max(1));
            let direction = if *count >= detent {
                Direction::Clockwise
            } else if *count <= -detent {
                Direction::CounterClockwise
            } else {
                continue;
            };
            *count = 0;
            let code = Code::Step {
                encoder: enc.id,
                direction,
            };
            for pressed in [true, false] {
                out.push(DebouncedEvent {
                    source: SourceKind::Rotary,
                    code: code.clone(),
                    pressed,
                    at: edge.at,
                });
            }
        }
    }
}

impl Filter for RotaryDecoder {
    fn feed(&mut self, raw: &RawEvent, out: &mut Vec<DebouncedEvent>) {
        let mut edges = std::mem::take(&mut self.scratch);
        self.lines.feed(raw, &mut edges);
        self.scratch = edges;
        self.decode(out);
    }

    fn poll(&mut self, now: Instant, out: &mut Vec<DebouncedEvent>) {
        let mut edges = std::mem::take(&mut self.scratch);
        self.lines.poll(now, &mut edges);
        self.scratch = edges;
        self.decode(out);
    }

    fn reset(&mut self) {
        self.lines.reset();
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.scratch.clear();
    }
}

/// Turns a stream of IR frames into press/release transitions.
///
/// Remotes only send frames while a button is down. Frames of the held button that
/// arrive within `repeat_gap` of the previous one keep it held, whatever their
/// repeat counter says. A later frame releases and presses it again; silence for
/// `release_after` releases it.
#[derive(Debug, Clone)]
pub struct IrRepeatFilter {
    repeat_gap: Duration,
    release_after: Duration,
    held: Option<(Code, Instant)>,
}

impl IrRepeatFilter {
    pub fn new(repeat_gap: Duration, release_after: Duration) -> Self {
        Self {
            repeat_gap,
            release_after: release_after.max(repeat_gap),
            held: None,
        }
    }

    /// Release the held button; `at` is when the release became certain.
    fn release(&mut self, at: Instant, out: &mut Vec<DebouncedEvent>) {
        if let Some((code, _)) = self.held.take() {
            out.push(DebouncedEvent {
                source: SourceKind::Ir,
                code,
                pressed: false,
                at,
            });
        }
    }
}

impl Filter for IrRepeatFilter {
    fn feed(&mut self, raw: &RawEvent, out: &mut Vec<DebouncedEvent>) {
        let RawState::IrCode { .. } = raw.state else {
            return;
        };
        self.poll(raw.at, out);

        if let Some((code, last)) = &mut self.held {
            let continued =
                *code == raw.code && raw.at.saturating_duration_since(*last) < self.repeat_gap;
            if continued {
                *last = raw.at;
                return;
            }
            self.release(raw.at, out);
        }

        self.held = Some((raw.code.clone(), raw.at));
        out.push(DebouncedEvent {
            source: SourceKind::Ir,
            code: raw.code.clone(),
            pressed: true,
            at: raw.at,
        });
    }

    fn poll(&mut self, now: Instant, out: &mut Vec<DebouncedEvent>) {
        if let Some((_, last)) = self.held {
            if now.saturating_duration_since(last) >= self.release_after {
                self.release(last + self.release_after, out);
            }
        }
    }

    fn reset(&mut self) {
        self.held = None;
    }
}

/// Activation/deactivation deltas of a touch pad (`release < touch`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PadThresholds {
    pub touch: u16,
    pub release: u16,
}

impl Default for PadThresholds {
    fn default() -> Self {
        Self {
            touch: 12,
            release: 6,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PadState {
    baseline: Option<f32>,
    active: bool,
}

/// Rolling-baseline touch detector for MPR121 electrode readings.
///
/// Touching a pad lowers its reading. The baseline follows slow drift while the pad
/// is idle and freezes while it is active.
#[derive(Debug, Clone)]
pub struct TouchFilter {
    defaults: PadThresholds,
    overrides: HashMap<u8, PadThresholds>,
    pads: BTreeMap<u8, PadState>,
}

/// Weight of a new reading in the baseline average.
const BASELINE_WEIGHT: f32 = 1.0 / 16.0;

impl TouchFilter {
    pub fn new(defaults: PadThresholds, overrides: HashMap<u8, PadThresholds>) -> Self {
        Self {
            defaults,
            overrides,
            pads: BTreeMap::new(),
        }
    }

    /// Current baseline of `pad`, if it has been seeded.
    pub fn baseline(&self, pad: u8) -> Option<f32> {
        self.pads.get(&pad).and_then(|p| p.baseline)
    }

}

impl Filter for TouchFilter {
    fn feed(&mut self, raw: &RawEvent, out: &mut Vec<DebouncedEvent>) {
        let (Code::Pad(pad), RawState::Capacitance(reading)) = (&raw.code, &raw.state) else {
            return;
        };
        let thresholds = self.overrides.get(pad).copied().unwrap_or(self.defaults);
        let state = self.pads.entry(*pad).or_default();
        let reading = f32::from(*reading);

        let Some(baseline) = state.baseline else {
            state.baseline = Some(reading);
            return;
        };
        let delta = baseline - reading;

        if !state.active {
            if delta >= f32::from(thresholds.touch) {
                state.active = true;
                out.push(DebouncedEvent {
                    source: SourceKind::Touch,
                    code: Code::Pad(*pad),
                    pressed: true,
                    at: raw.at,
                });
            } else {
                state.baseline = Some(baseline + (reading - baseline) * BASELINE_WEIGHT);
            }
        } else if delta <= f32::from(thresholds.release) {
            state.active = false;
            out.push(DebouncedEvent {
                source: SourceKind::Touch,
                code: Code::Pad(*pad),
                pressed: false,
                at: raw.at,
            });
        }
    }

    fn poll(&mut self, _now: Instant, _out: &mut Vec<DebouncedEvent>) {}

    fn reset(&mut self) {
        for state in self.pads.values_mut() {
            state.active = false;
        }
    }

    fn baselines(&self) -> BTreeMap<u8, f32> {
        self.pads
            .iter()
            .filter_map(|(pad, s)| s.baseline.map(|b| (*pad, b)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn level(pin: u32, pressed: bool, at: Instant) -> RawEvent {
        RawEvent {
            source: SourceKind::Gpio,
            code: Code::Pin(pin),
            state: RawState::Level(pressed),
            at,
        }
    }

    fn rotary(pin: u32, high: bool, at: Instant) -> RawEvent {
        RawEvent {
            source: SourceKind::Rotary,
            code: Code::Pin(pin),
            state: RawState::Level(high),
            at,
        }
    }

    fn ir(name: &str, repeat: u32, at: Instant) -> RawEvent {
        RawEvent {
            source: SourceKind::Ir,
            code: Code::Ir(name.into()),
            state: RawState::IrCode { repeat },
            at,
        }
    }

    fn pad(idx: u8, reading: u16, at: Instant) -> RawEvent {
        RawEvent {
            source: SourceKind::Touch,
            code: Code::Pad(idx),
            state: RawState::Capacitance(reading),
            at,
        }
    }

    #[test]
    fn bounce_shorter_than_window_is_suppressed() {
        let t0 = Instant::now();
        let mut f = PinDebouncer::buttons(ms(30));
        let mut out = Vec::new();

        // Chatter for 25 ms, settling back on released.
        for (i, pressed) in [true, false, true, false, true, false].into_iter().enumerate() {
            f.feed(&level(17, pressed, t0 + ms(i as u64 * 5)), &mut out);
        }
        f.poll(t0 + ms(200), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn stable_press_is_stamped_at_stabilization() {
        let t0 = Instant::now();
        let mut f = PinDebouncer::buttons(ms(30));
        let mut out = Vec::new();

        f.feed(&level(17, true, t0), &mut out);
        f.feed(&level(17, false, t0 + ms(4)), &mut out);
        f.feed(&level(17, true, t0 + ms(8)), &mut out);
        f.poll(t0 + ms(20), &mut out);
        assert!(out.is_empty());

        f.poll(t0 + ms(40), &mut out);
        assert_eq!(
            out,
            vec![DebouncedEvent {
                source: SourceKind::Gpio,
                code: Code::Pin(17),
                pressed: true,
                at: t0 + ms(38),
            }]
        );
    }

    #[test]
    fn per_pin_window_override() {
        let t0 = Instant::now();
        let mut f = PinDebouncer::buttons(ms(30)).with_window(22, ms(5));
        let mut out = Vec::new();

        f.feed(&level(17, true, t0), &mut out);
        f.feed(&level(22, true, t0), &mut out);
        f.poll(t0 + ms(10), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, Code::Pin(22));
    }

    #[test]
    fn matured_candidate_commits_before_next_sample() {
        let t0 = Instant::now();
        let mut f = PinDebouncer::buttons(ms(10));
        let mut out = Vec::new();

        f.feed(&level(5, true, t0), &mut out);
        // No poll in between: the release sample itself must commit the press first.
        f.feed(&level(5, false, t0 + ms(50)), &mut out);
        f.poll(t0 + ms(60), &mut out);
        let pressed: Vec<bool> = out.iter().map(|e| e.pressed).collect();
        assert_eq!(pressed, vec![true, false]);
    }

    fn turn(f: &mut RotaryDecoder, seq: &[(bool, bool)], t0: Instant, out: &mut Vec<DebouncedEvent>) {
        let mut at = t0;
        let mut prev = (true, true);
        for &(a, b) in seq {
            at += ms(5);
            if a != prev.0 {
                f.feed(&rotary(5, a, at), out);
            }
            if b != prev.1 {
                f.feed(&rotary(6, b, at), out);
            }
            f.poll(at + ms(3), out);
            prev = (a, b);
        }
    }

    #[test]
    fn rotary_detent_emits_one_tap_per_direction() {
        let t0 = Instant::now();
        let mut f = RotaryDecoder::new(
            vec![EncoderPins {
                id: 0,
                pin_a: 5,
                pin_b: 6,
                steps_per_detent: 4,
            }],
            ms(2),
        );
        let mut out = Vec::new();
        // Seed the resting state (both lines high).
        f.feed(&rotary(5, true, t0), &mut out);
        f.feed(&rotary(6, true, t0), &mut out);
        assert!(out.is_empty());

        // 11 -> 01 -> 00 -> 10 -> 11: A falls first.
        turn(&mut f, &[(false, true), (false, false), (true, false), (true, true)], t0, &mut out);
        let cw = Code::Step {
            encoder: 0,
            direction: Direction::Clockwise,
        };
        let ccw = Code::Step {
            encoder: 0,
            direction: Direction::CounterClockwise,
        };
        let first: Vec<_> = out.iter().map(|e| (e.code.clone(), e.pressed)).collect();
        assert_eq!(first.len(), 2);
        out.clear();

        // Reverse order: B falls first.
        turn(&mut f, &[(true, false), (false, false), (false, true), (true, true)], t0 + ms(100), &mut out);
        let second: Vec<_> = out.iter().map(|e| (e.code.clone(), e.pressed)).collect();
        assert_eq!(second.len(), 2);

        assert_ne!(first[0].0, second[0].0);
        assert!([cw, ccw].contains(&first[0].0));
        assert_eq!((first[0].1, first[1].1), (true, false));
    }

    #[test]
    fn half_detent_does_not_emit() {
        let t0 = Instant::now();
        let mut f = RotaryDecoder::new(
            vec![EncoderPins {
                id: 0,
                pin_a: 5,
                pin_b: 6,
                steps_per_detent: 4,
            }],
            ms(2),
        );
        let mut out = Vec::new();
        f.feed(&rotary(5, true, t0), &mut out);
        f.feed(&rotary(6, true, t0), &mut out);
        turn(&mut f, &[(false, true), (false, false)], t0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn coarse_detent_counts_past_i8() {
        let t0 = Instant::now();
        let mut f = RotaryDecoder::new(
            vec![EncoderPins {
                id: 0,
                pin_a: 5,
                pin_b: 6,
                steps_per_detent: 200,
            }],
            ms(2),
        );
        let mut out = Vec::new();
        f.feed(&rotary(5, true, t0), &mut out);
        f.feed(&rotary(6, true, t0), &mut out);
        turn(&mut f, &[(false, true)], t0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn ir_repeats_keep_key_held() {
        let t0 = Instant::now();
        let mut f = IrRepeatFilter::new(ms(200), ms(250));
        let mut out = Vec::new();

        f.feed(&ir("KEY_UP", 0, t0), &mut out);
        for i in 1..=5 {
            f.feed(&ir("KEY_UP", i, t0 + ms(110 * u64::from(i))), &mut out);
        }
        assert_eq!(out.len(), 1);
        assert!(out[0].pressed);

        f.poll(t0 + ms(700), &mut out);
        assert_eq!(out.len(), 1);
        f.poll(t0 + ms(800), &mut out);
        assert_eq!(out.len(), 2);
        assert!(!out[1].pressed);
        assert_eq!(out[1].at, t0 + ms(800));
    }

    #[test]
    fn ir_repeat_frame_after_gap_presses_again() {
        let t0 = Instant::now();
        let mut f = IrRepeatFilter::new(ms(200), ms(250));
        let mut out = Vec::new();

        f.feed(&ir("KEY_UP", 0, t0), &mut out);
        // Flagged as a repeat, but past the gap and before the release timeout.
        f.feed(&ir("KEY_UP", 1, t0 + ms(220)), &mut out);
        let seen: Vec<_> = out.iter().map(|e| (e.pressed, e.at)).collect();
        assert_eq!(
            seen,
            vec![(true, t0), (false, t0 + ms(220)), (true, t0 + ms(220))]
        );
    }

    #[test]
    fn ir_duplicate_inside_gap_is_a_repeat() {
        let t0 = Instant::now();
        let mut f = IrRepeatFilter::new(ms(200), ms(250));
        let mut out = Vec::new();

        // Some receivers report a fresh frame (repeat 0) for a duplicate.
        f.feed(&ir("KEY_OK", 0, t0), &mut out);
        f.feed(&ir("KEY_OK", 0, t0 + ms(120)), &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn ir_other_button_releases_held_one() {
        let t0 = Instant::now();
        let mut f = IrRepeatFilter::new(ms(200), ms(250));
        let mut out = Vec::new();

        f.feed(&ir("KEY_UP", 0, t0), &mut out);
        f.feed(&ir("KEY_DOWN", 0, t0 + ms(100)), &mut out);
        let seen: Vec<_> = out.iter().map(|e| (e.code.to_string(), e.pressed)).collect();
        assert_eq!(
            seen,
            vec![
                ("KEY_UP".to_string(), true),
                ("KEY_UP".to_string(), false),
                ("KEY_DOWN".to_string(), true),
            ]
        );
    }

    #[test]
    fn touch_uses_hysteresis() {
        let t0 = Instant::now();
        let mut f = TouchFilter::new(PadThresholds::default(), HashMap::new());
        let mut out = Vec::new();

        f.feed(&pad(3, 200, t0), &mut out);
        assert_eq!(f.baseline(3), Some(200.0));

        // delta 10 < touch 12
        f.feed(&pad(3, 190, t0 + ms(20)), &mut out);
        assert!(out.is_empty());
        let drifted = f.baseline(3).unwrap();
        assert!(drifted < 200.0);

        f.feed(&pad(3, 180, t0 + ms(40)), &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].pressed);

        // Between the thresholds: stays active, baseline frozen.
        f.feed(&pad(3, drifted as u16 - 9, t0 + ms(60)), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(f.baseline(3), Some(drifted));

        f.feed(&pad(3, drifted as u16 - 2, t0 + ms(80)), &mut out);
        assert_eq!(out.len(), 2);
        assert!(!out[1].pressed);
    }

    #[test]
    fn touch_thresholds_per_pad() {
        let t0 = Instant::now();
        let mut overrides = HashMap::new();
        overrides.insert(
            1,
            PadThresholds {
                touch: 30,
                release: 20,
            },
        );
        let mut f = TouchFilter::new(PadThresholds::default(), overrides);
        let mut out = Vec::new();

        f.feed(&pad(0, 200, t0), &mut out);
        f.feed(&pad(1, 200, t0), &mut out);
        f.feed(&pad(0, 185, t0 + ms(10)), &mut out);
        f.feed(&pad(1, 185, t0 + ms(10)), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, Code::Pad(0));
    }
}
