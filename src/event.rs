//! Events and source codes.
//!
//! Input flows through three event shapes, each owned by one pipeline stage:
//!
//! - [`RawEvent`]: what a sampler saw on the wire (pin level, capacitance reading,
//!   decoded IR button). Never persisted.
//! - [`DebouncedEvent`]: a raw transition that survived the filter stage, reduced to
//!   pressed/released. Its timestamp is the *stabilization* time.
//! - [`ClassifiedEvent`]: a semantic action on a [`LogicalKey`], the only thing
//!   subscribers ever see.
//!
//! ## Source codes
//! Each source addresses its inputs differently; [`Code`] keeps them typed and has a
//! per-source textual form used in configuration files:
//! - GPIO: BCM pin number (`"17"`)
//! - rotary: encoder id and direction (`"0:cw"`, `"0:ccw"`)
//! - touch: pad index (`"3"`)
//! - IR: LIRC button name (`"KEY_UP"`)

use crate::key::LogicalKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Physical source family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Gpio,
    Rotary,
    Touch,
    Ir,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Gpio,
        SourceKind::Rotary,
        SourceKind::Touch,
        SourceKind::Ir,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Gpio => "gpio",
            SourceKind::Rotary => "rotary",
            SourceKind::Touch => "touch",
            SourceKind::Ir => "ir",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = CodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CodeParseError::UnknownSource(s.to_string()))
    }
}

/// Rotation direction of an encoder detent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

/// Source-specific identity of a physical input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Code {
    /// BCM GPIO line (buttons, encoder A/B lines).
    Pin(u32),
    /// One detent of a rotary encoder.
    Step { encoder: u8, direction: Direction },
    /// MPR121 electrode index (0..12).
    Pad(u8),
    /// LIRC button name as reported by lircd.
    Ir(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeParseError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("invalid {kind} code {text:?}")]
    Invalid { kind: SourceKind, text: String },
}

impl Code {
    /// Parse the configuration form of a code for `source`.
    pub fn parse(source: SourceKind, text: &str) -> Result<Self, CodeParseError> {
        let invalid = || CodeParseError::Invalid {
            kind: source,
            text: text.to_string(),
        };
        let text = text.trim();
        match source {
            SourceKind::Gpio => text.parse().map(Code::Pin).map_err(|_| invalid()),
            SourceKind::Touch => match text.parse::<u8>() {
                Ok(pad) if pad < 12 => Ok(Code::Pad(pad)),
                _ => Err(invalid()),
            },
            SourceKind::Rotary => {
                let (enc, dir) = text.split_once(':').ok_or_else(invalid)?;
                let encoder = enc.parse().map_err(|_| invalid())?;
                let direction = match dir {
                    "cw" => Direction::Clockwise,
                    "ccw" => Direction::CounterClockwise,
                    _ => return Err(invalid()),
                };
                Ok(Code::Step { encoder, direction })
            }
            SourceKind::Ir => {
                if text.is_empty() || text.contains(char::is_whitespace) {
                    Err(invalid())
                } else {
                    Ok(Code::Ir(text.to_string()))
                }
            }
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Pin(pin) => write!(f, "{pin}"),
            Code::Step {
                encoder,
                direction: Direction::Clockwise,
            } => write!(f, "{encoder}:cw"),
            Code::Step {
                encoder,
                direction: Direction::CounterClockwise,
            } => write!(f, "{encoder}:ccw"),
            Code::Pad(pad) => write!(f, "{pad}"),
            Code::Ir(name) => f.write_str(name),
        }
    }
}

/// Source-specific reading carried by a [`RawEvent`].
#[derive(Clone, Debug, PartialEq)]
pub enum RawState {
    /// Logical pin level, already corrected for active-low wiring (`true` = pressed).
    Level(bool),
    /// MPR121 filtered electrode data (10-bit).
    Capacitance(u16),
    /// One decoded IR frame; `repeat` is lircd's repeat counter.
    IrCode { repeat: u32 },
}

/// Unfiltered sample from a device.
#[derive(Clone, Debug)]
pub struct RawEvent {
    pub source: SourceKind,
    pub code: Code,
    pub state: RawState,
    /// Capture time (monotonic).
    pub at: Instant,
}

/// A transition that passed the filter stage.
#[derive(Clone, Debug, PartialEq)]
pub struct DebouncedEvent {
    pub source: SourceKind,
    pub code: Code,
    pub pressed: bool,
    /// Time the new state became trusted, not the first edge.
    pub at: Instant,
}

/// Semantic classification of a key interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Press,
    ShortRelease,
    LongHold,
    Repeat,
}

/// The unit delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedEvent {
    pub key: LogicalKey,
    pub action: ActionKind,
    pub at: Instant,
    pub source: SourceKind,
}

/// Serialized form sent to subscriber processes.
///
/// `ts_ms` counts milliseconds since the daemon's epoch (usually process start),
/// since `Instant` has no meaning outside the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub key: LogicalKey,
    pub action: ActionKind,
    pub source: SourceKind,
    pub ts_ms: u64,
}

impl ClassifiedEvent {
    pub fn to_wire(&self, epoch: Instant) -> WireEvent {
        WireEvent {
            key: self.key.clone(),
            action: self.action,
            source: self.source,
            ts_ms: self.at.saturating_duration_since(epoch).as_millis() as u64,
        }
    }
}
