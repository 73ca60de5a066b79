//! MPR121 capacitive touch controller over I²C.
//!
//! The chip runs with its own baseline tracking disabled; [`TouchFilter`]
//! keeps the baselines so thresholds behave the same on every board.
//!
//! [`TouchFilter`]: crate::debounce::TouchFilter

use crate::device::{SampleError, Sampler};
use crate::event::{Code, RawEvent, RawState, SourceKind};
use embedded_hal::i2c::{Error as _, I2c};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x5A;
pub const ELECTRODES: usize = 12;

const REG_FILTERED_DATA: u8 = 0x04;
const REG_CONFIG1: u8 = 0x5C;
const REG_CONFIG2: u8 = 0x5D;
const REG_ECR: u8 = 0x5E;
const REG_SOFT_RESET: u8 = 0x80;

/// Register writes that bring the chip from any state to running.
const INIT_SEQUENCE: [(u8, u8); 5] = [
    (REG_SOFT_RESET, 0x63),
    // Stop mode; configuration registers are only writable while stopped.
    (REG_ECR, 0x00),
    // 16 µA charge current, 6 samples for the first filter.
    (REG_CONFIG1, 0x10),
    // 0.5 µs charge time, 4 samples, 1 ms period.
    (REG_CONFIG2, 0x20),
    // Run: electrodes 0..11, calibration lock off.
    (REG_ECR, 0x0C),
];

pub struct Mpr121Sampler<I2C> {
    i2c: I2C,
    address: u8,
    name: String,
    pads: Vec<u8>,
    last: [Option<u16>; ELECTRODES],
    initialized: bool,
    interval: Duration,
    next_poll: Instant,
    pending: VecDeque<RawEvent>,
}

impl<I2C: I2c + Send> Mpr121Sampler<I2C> {
    /// The chip is configured lazily: the first sample (or an explicit
    /// [`init`](Self::init)) runs the start-up sequence.
    pub fn new(i2c: I2C, address: u8, pads: Vec<u8>, interval: Duration) -> Self {
        let pads = pads
            .into_iter()
            .filter(|p| usize::from(*p) < ELECTRODES)
            .collect();
        Self {
            i2c,
            address,
            name: format!("touch:0x{address:02x}"),
            pads,
            last: [None; ELECTRODES],
            initialized: false,
            interval,
            next_poll: Instant::now(),
            pending: VecDeque::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn bus_error(&self, e: I2C::Error) -> SampleError {
        SampleError::Unavailable(format!("i2c 0x{:02x}: {:?}", self.address, e.kind()))
    }

    pub fn init(&mut self) -> Result<(), SampleError> {
        self.initialized = false;
        for (reg, value) in INIT_SEQUENCE {
            if let Err(e) = self.i2c.write(self.address, &[reg, value]) {
                return Err(self.bus_error(e));
            }
        }
        self.last = [None; ELECTRODES];
        self.initialized = true;
        debug!(address = self.address, "mpr121 initialized");
        Ok(())
    }

    /// Filtered data of all electrodes (10 bit).
    pub fn read_electrodes(&mut self) -> Result<[u16; ELECTRODES], SampleError> {
        let mut buf = [0u8; ELECTRODES * 2];
        if let Err(e) = self
            .i2c
            .write_read(self.address, &[REG_FILTERED_DATA], &mut buf)
        {
            return Err(self.bus_error(e));
        }
        let mut out = [0u16; ELECTRODES];
        for (value, bytes) in out.iter_mut().zip(buf.chunks_exact(2)) {
            *value = u16::from_le_bytes([bytes[0], bytes[1]]) & 0x03FF;
        }
        Ok(out)
    }

    /// Read once and queue a raw event per configured pad whose reading changed.
    pub fn poll_once(&mut self, at: Instant) -> Result<(), SampleError> {
        if !self.initialized {
            self.init()?;
        }
        let values = match self.read_electrodes() {
            Ok(values) => values,
            Err(e) => {
                self.initialized = false;
                return Err(e);
            }
        };
        for &pad in &self.pads {
            let value = values[usize::from(pad)];
            let slot = &mut self.last[usize::from(pad)];
            if *slot != Some(value) {
                *slot = Some(value);
                self.pending.push_back(RawEvent {
                    source: SourceKind::Touch,
                    code: Code::Pad(pad),
                    state: RawState::Capacitance(value),
                    at,
                });
            }
        }
        Ok(())
    }

    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c + Send> Sampler for Mpr121Sampler<I2C> {
    fn source(&self) -> SourceKind {
        SourceKind::Touch
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
                self.next_poll = now + self.interval;
                self.poll_once(now)?;
                continue;
            }
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.next_poll.min(deadline) - now);
        }
    }

    fn recover(&mut self) -> Result<(), SampleError> {
        self.pending.clear();
        self.init()
    }
}
