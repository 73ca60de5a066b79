//! Touch gesture recognition.
//!
//! [`GestureRecognizer`] sits between the touch filter and the classifier. Pad
//! transitions are held back for a short window; if the presses collected in that
//! window end with a configured pattern, the pattern's synthetic key is emitted and
//! the individual pad events are discarded. Otherwise the buffered events are
//! released, in order and with their original timestamps, to normal single-pad
//! classification once the window expires.
//!
//! # Invariants
//! 1. A pad event is either part of exactly one gesture or forwarded exactly once.
//! 2. Releases of pads consumed by a gesture never reach the classifier.
//! 3. Forwarded events keep their relative order.

use crate::event::{Code, DebouncedEvent};
use crate::key::LogicalKey;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(200);

/// Spatio-temporal pattern of pad activations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GesturePattern {
    /// Pads activated in exactly this order (e.g. `[0, 1, 2]` for an ascending swipe).
    Swipe { pads: Vec<u8> },
    /// The same pad tapped `count` times.
    MultiTap { pad: u8, count: u8 },
}

impl GesturePattern {
    fn sequence(&self) -> Vec<u8> {
        match self {
            GesturePattern::Swipe { pads } => pads.clone(),
            GesturePattern::MultiTap { pad, count } => vec![*pad; usize::from(*count)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gesture {
    pub pattern: GesturePattern,
    pub key: LogicalKey,
}

/// What the recognizer hands on to the classifier stage.
#[derive(Debug, Clone, PartialEq)]
pub enum GestureOutput {
    /// A pad event that belongs to no gesture.
    Pad(DebouncedEvent),
    /// A recognized gesture, to be emitted as a tap of `key`.
    Gesture { key: LogicalKey, at: Instant },
}

#[derive(Debug, Clone)]
pub struct GestureRecognizer {
    gestures: Vec<(Vec<u8>, LogicalKey)>,
    window: Duration,
    pending: VecDeque<DebouncedEvent>,
    swallowed: HashSet<u8>,
}

impl GestureRecognizer {
    /// Longer patterns are tried first so a prefix never shadows them.
    pub fn new(gestures: Vec<Gesture>, window: Duration) -> Self {
        let mut gestures: Vec<(Vec<u8>, LogicalKey)> = gestures
            .into_iter()
            .map(|g| (g.pattern.sequence(), g.key))
            .filter(|(seq, _)| !seq.is_empty())
            .collect();
        gestures.sort_by_key(|(seq, _)| std::cmp::Reverse(seq.len()));
        Self {
            gestures,
            window,
            pending: VecDeque::new(),
            swallowed: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gestures.is_empty()
    }

    pub fn push(&mut self, event: DebouncedEvent, out: &mut Vec<GestureOutput>) {
        let Code::Pad(pad) = event.code else {
            out.push(GestureOutput::Pad(event));
            return;
        };
        if self.gestures.is_empty() {
            out.push(GestureOutput::Pad(event));
            return;
        }
        if !event.pressed && self.swallowed.remove(&pad) {
            return;
        }

        let pressed = event.pressed;
        let at = event.at;
        self.pending.push_back(event);
        if pressed {
            self.try_match(at, out);
        }
    }

    /// Forward buffered events whose window expired without a match.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<GestureOutput>) {
        loop {
            while self.pending.front().is_some_and(|e| !e.pressed) {
                if let Some(ev) = self.pending.pop_front() {
                    out.push(GestureOutput::Pad(ev));
                }
            }
            let Some(first) = self.pending.front() else {
                return;
            };
            if now.saturating_duration_since(first.at) < self.window {
                return;
            }
            // Flush the expired press and everything up to the next press.
            if let Some(ev) = self.pending.pop_front() {
                out.push(GestureOutput::Pad(ev));
            }
            while self.pending.front().is_some_and(|e| !e.pressed) {
                if let Some(ev) = self.pending.pop_front() {
                    out.push(GestureOutput::Pad(ev));
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.swallowed.clear();
    }

    fn try_match(&mut self, now: Instant, out: &mut Vec<GestureOutput>) {
        let presses: Vec<(usize, u8, Instant)> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pressed)
            .filter_map(|(i, e)| match e.code {
                Code::Pad(p) => Some((i, p, e.at)),
                _ => None,
            })
            .collect();

        let matched = self.gestures.iter().find_map(|(seq, key)| {
            if presses.len() < seq.len() {
                return None;
            }
            let tail = &presses[presses.len() - seq.len()..];
            let same_pads = tail.iter().map(|(_, p, _)| *p).eq(seq.iter().copied());
            let in_window = now.saturating_duration_since(tail[0].2) <= self.window;
            (same_pads && in_window).then(|| (tail[0].0, key.clone()))
        });
        let Some((start, key)) = matched else {
            return;
        };

        // Older, unrelated events go on to single-pad classification first.
        for ev in self.pending.drain(..start) {
            out.push(GestureOutput::Pad(ev));
        }

        let consumed: Vec<DebouncedEvent> = self.pending.drain(..).collect();
        let mut still_down: HashSet<u8> = HashSet::new();
        for ev in consumed {
            let Code::Pad(pad) = ev.code else { continue };
            if ev.pressed {
                still_down.insert(pad);
            } else if !still_down.remove(&pad) {
                // Release of a pad pressed before the gesture started.
                out.push(GestureOutput::Pad(ev));
            }
        }
        debug!(%key, "touch gesture recognized");
        self.swallowed.extend(still_down);
        out.push(GestureOutput::Gesture { key, at: now });
    }
}
