//! Polled GPIO lines: push buttons and rotary encoder A/B pins.

use crate::device::{SampleError, Sampler};
use crate::event::{Code, RawEvent, RawState, SourceKind};
use embedded_hal::digital::{Error as _, InputPin};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

/// Samples a fixed set of input pins at a bounded rate and reports level
/// changes. The first reading of every pin is always reported.
pub struct PinSampler<P> {
    source: SourceKind,
    name: String,
    pins: Vec<(u32, P)>,
    active_low: bool,
    last: Vec<Option<bool>>,
    interval: Duration,
    next_poll: Instant,
    pending: VecDeque<RawEvent>,
}

impl<P: InputPin + Send> PinSampler<P> {
    /// `pins` pairs each BCM line number with its opened pin. With `active_low`, a
    /// low line reads as pressed.
    pub fn new(
        source: SourceKind,
        name: impl Into<String>,
        pins: Vec<(u32, P)>,
        active_low: bool,
        interval: Duration,
    ) -> Self {
        let last = vec![None; pins.len()];
        Self {
            source,
            name: name.into(),
            pins,
            active_low,
            last,
            interval,
            next_poll: Instant::now(),
            pending: VecDeque::new(),
        }
    }

    /// Read every pin once, queueing a raw event for each change.
    pub fn poll_once(&mut self, at: Instant) -> Result<(), SampleError> {
        for (idx, (line, pin)) in self.pins.iter_mut().enumerate() {
            let high = pin.is_high().map_err(|e| {
                SampleError::Unavailable(format!("gpio line {line}: {:?}", e.kind()))
            })?;
            let level = high != self.active_low;
            if self.last[idx] != Some(level) {
                self.last[idx] = Some(level);
                self.pending.push_back(RawEvent {
                    source: self.source,
                    code: Code::Pin(*line),
                    state: RawState::Level(level),
                    at,
                });
            }
        }
        Ok(())
    }

    /// Hand back the pins, e.g. to close the lines.
    pub fn release(self) -> Vec<P> {
        self.pins.into_iter().map(|(_, pin)| pin).collect()
    }
}

impl<P: InputPin + Send> Sampler for PinSampler<P> {
    fn source(&self) -> SourceKind {
        self.source
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self, timeout: Duration) -> Result<Option<RawEvent>, SampleError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(raw) = self.pending.pop_front() {
                return Ok(Some(raw));
            }
            let now = Instant::now();
            if now >= self.next_poll {
                self.poll_once(now)?;
                self.next_poll = now + self.interval;
                continue;
            }
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.next_poll.min(deadline) - now);
        }
    }

    /// Lines stay requested across read errors; forget the last levels so the
    /// next reading is reported afresh.
    fn recover(&mut self) -> Result<(), SampleError> {
        self.last.iter_mut().for_each(|l| *l = None);
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };
    use embedded_hal_mock::eh1::MockError;
    use std::io::ErrorKind;

    fn levels(sampler: &mut PinSampler<PinMock>) -> Vec<(u32, bool)> {
        std::iter::from_fn(|| sampler.pending.pop_front())
            .map(|raw| match (raw.code, raw.state) {
                (Code::Pin(pin), RawState::Level(level)) => (pin, level),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn reports_first_reading_then_changes_only() {
        let button = PinMock::new(&[
            PinTransaction::get(PinState::High),
            PinTransaction::get(PinState::Low),
            PinTransaction::get(PinState::Low),
        ]);
        let mut sampler = PinSampler::new(
            SourceKind::Gpio,
            "gpio:test",
            vec![(17, button.clone())],
            true,
            Duration::from_millis(5),
        );

        let t0 = Instant::now();
        for _ in 0..3 {
            sampler.poll_once(t0).unwrap();
        }
        // Pull-up button: high is released, low is pressed.
        assert_eq!(levels(&mut sampler), vec![(17, false), (17, true)]);

        for mut pin in sampler.release() {
            pin.done();
        }
    }

    #[test]
    fn active_high_encoder_lines() {
        let a = PinMock::new(&[PinTransaction::get(PinState::High)]);
        let b = PinMock::new(&[PinTransaction::get(PinState::Low)]);
        let mut sampler = PinSampler::new(
            SourceKind::Rotary,
            "rotary:test",
            vec![(5, a), (6, b)],
            false,
            Duration::from_millis(1),
        );

        sampler.poll_once(Instant::now()).unwrap();
        assert_eq!(levels(&mut sampler), vec![(5, true), (6, false)]);
        for mut pin in sampler.release() {
            pin.done();
        }
    }

    #[test]
    fn read_error_is_unavailable() {
        let broken = PinMock::new(&[PinTransaction::get(PinState::High)
            .with_error(MockError::Io(ErrorKind::NotConnected))]);
        let mut sampler = PinSampler::new(
            SourceKind::Gpio,
            "gpio:test",
            vec![(4, broken)],
            true,
            Duration::from_millis(5),
        );

        assert!(matches!(
            sampler.sample(Duration::from_millis(1)),
            Err(SampleError::Unavailable(_))
        ));
        sampler.recover().unwrap();
        for mut pin in sampler.release() {
            pin.done();
        }
    }
}
