//! TOML configuration.
//!
//! Every section is optional; missing values take the defaults below. A loaded
//! [`Config`] has always passed [`Config::validate`], so the accessors that build
//! runtime tables can assume well-formed codes and thresholds.
//!
//! ```toml
//! [sources.gpio]
//! enabled = true
//! debounce_ms = 30
//!
//! [bindings.gpio]
//! "17" = "KEY_LEFT"
//!
//! [keys.KEY_LEFT]
//! repeat_ms = 250
//!
//! [[touch.gestures.patterns]]
//! kind = "swipe_both"
//! pads = [0, 1, 2]
//! key = "KEY_NEXT"
//! reverse_key = "KEY_PREVIOUS"
//! ```

use crate::binding::{KeyMap, PhysicalBinding};
use crate::classifier::{Timing, TimingTable, DEFAULT_LONG_PRESS, DEFAULT_REPEAT};
use crate::debounce::{EncoderPins, PadThresholds};
use crate::error::ConfigError;
use crate::event::{Code, SourceKind};
use crate::eventbus::{PublisherConfig, TieBreak, DEFAULT_QUEUE_DEPTH, DEFAULT_REORDER_WINDOW};
use crate::gesture::{Gesture, GesturePattern, DEFAULT_WINDOW};
use crate::key::LogicalKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keyrelay/keyrelay.toml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/keyrelay/events.sock";
pub const DEFAULT_LIRC_SOCKET: &str = "/var/run/lirc/lircd";

/// Electrodes on one MPR121.
pub const PAD_COUNT: u8 = 12;

/// Quadrature steps per detent accepted for an encoder.
pub const MAX_STEPS_PER_DETENT: u8 = 64;

const DEFAULT_LONG_PRESS_MS: u64 = DEFAULT_LONG_PRESS.as_millis() as u64;
const DEFAULT_REPEAT_MS: u64 = DEFAULT_REPEAT.as_millis() as u64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: Sources,
    pub bindings: Bindings,
    /// Per-key overrides, keyed by logical key name.
    pub keys: BTreeMap<LogicalKey, KeyTiming>,
    pub touch: TouchSettings,
    pub publisher: PublisherSettings,
    pub socket: SocketSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sources {
    pub gpio: GpioSettings,
    pub rotary: RotarySettings,
    pub touch: TouchSourceSettings,
    pub ir: IrSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub repeat_ms: u64,
    /// Buttons pull the line to ground when pressed.
    pub active_low: bool,
    pub chip: PathBuf,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 5,
            debounce_ms: 30,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            repeat_ms: DEFAULT_REPEAT_MS,
            active_low: true,
            chip: PathBuf::from("/dev/gpiochip0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotarySettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub repeat_ms: u64,
    pub chip: PathBuf,
    pub encoders: Vec<EncoderSettings>,
}

impl Default for RotarySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 1,
            debounce_ms: 2,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            repeat_ms: DEFAULT_REPEAT_MS,
            chip: PathBuf::from("/dev/gpiochip0"),
            encoders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub id: u8,
    pub pin_a: u32,
    pub pin_b: u32,
    #[serde(default = "default_steps_per_detent")]
    pub steps_per_detent: u8,
}

fn default_steps_per_detent() -> u8 {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TouchSourceSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub long_press_ms: u64,
    pub repeat_ms: u64,
    pub i2c_bus: PathBuf,
    pub address: u8,
    pub touch_threshold: u16,
    pub release_threshold: u16,
}

impl Default for TouchSourceSettings {
    fn default() -> Self {
        let thresholds = PadThresholds::default();
        Self {
            enabled: false,
            poll_interval_ms: 20,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            repeat_ms: DEFAULT_REPEAT_MS,
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            address: 0x5A,
            touch_threshold: thresholds.touch,
            release_threshold: thresholds.release,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrSettings {
    pub enabled: bool,
    pub socket: PathBuf,
    pub repeat_gap_ms: u64,
    pub release_ms: u64,
    pub long_press_ms: u64,
    pub repeat_ms: u64,
}

impl Default for IrSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            socket: PathBuf::from(DEFAULT_LIRC_SOCKET),
            repeat_gap_ms: 200,
            release_ms: 250,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            repeat_ms: DEFAULT_REPEAT_MS,
        }
    }
}

/// `code = "KEY_NAME"` tables, one per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bindings {
    pub gpio: BTreeMap<String, LogicalKey>,
    pub rotary: BTreeMap<String, LogicalKey>,
    pub touch: BTreeMap<String, LogicalKey>,
    pub ir: BTreeMap<String, LogicalKey>,
}

impl Bindings {
    pub fn get(&self, source: SourceKind) -> &BTreeMap<String, LogicalKey> {
        match source {
            SourceKind::Gpio => &self.gpio,
            SourceKind::Rotary => &self.rotary,
            SourceKind::Touch => &self.touch,
            SourceKind::Ir => &self.ir,
        }
    }

    fn get_mut(&mut self, source: SourceKind) -> &mut BTreeMap<String, LogicalKey> {
        match source {
            SourceKind::Gpio => &mut self.gpio,
            SourceKind::Rotary => &mut self.rotary,
            SourceKind::Touch => &mut self.touch,
            SourceKind::Ir => &mut self.ir,
        }
    }
}

/// Overrides for one logical key. Unset fields fall back to the source default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_press_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TouchSettings {
    /// Per-pad threshold overrides, keyed by pad index.
    pub pads: BTreeMap<String, PadSettings>,
    pub gestures: GestureSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PadSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touch_threshold: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_threshold: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureSettings {
    pub window_ms: u64,
    pub patterns: Vec<GestureConfig>,
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GestureConfig {
    Swipe {
        pads: Vec<u8>,
        key: LogicalKey,
    },
    /// A swipe plus its mirror image under a second key.
    SwipeBoth {
        pads: Vec<u8>,
        key: LogicalKey,
        reverse_key: LogicalKey,
    },
    MultiTap {
        pad: u8,
        count: u8,
        key: LogicalKey,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    #[default]
    SourcePriority,
    Arrival,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub queue_depth: usize,
    pub tie_break: TieBreakPolicy,
    /// Source order for `source_priority`, highest first.
    pub priority: Vec<SourceKind>,
    pub reorder_ms: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            tie_break: TieBreakPolicy::SourcePriority,
            priority: SourceKind::ALL.to_vec(),
            reorder_ms: DEFAULT_REORDER_WINDOW.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), bindings = config.binding_count(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration back, e.g. after a mapping edit.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.to_toml_string()?;
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Write next to the target and rename, so readers never see half a file.
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, text).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn binding_count(&self) -> usize {
        SourceKind::ALL
            .iter()
            .map(|s| self.bindings.get(*s).len())
            .sum()
    }

    /// Check everything the runtime tables rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keymap()?;
        self.gestures()?;
        self.pad_thresholds()?;

        if self.publisher.queue_depth == 0 {
            return Err(invalid("publisher.queue_depth must be at least 1"));
        }

        let mut ids = HashSet::new();
        for enc in &self.sources.rotary.encoders {
            if !ids.insert(enc.id) {
                return Err(invalid(format!("duplicate encoder id {}", enc.id)));
            }
            if !(1..=MAX_STEPS_PER_DETENT).contains(&enc.steps_per_detent) {
                return Err(invalid(format!(
                    "encoder {}: steps_per_detent must be within 1..={MAX_STEPS_PER_DETENT}",
                    enc.id
                )));
            }
            if enc.pin_a == enc.pin_b {
                return Err(invalid(format!("encoder {}: pin_a equals pin_b", enc.id)));
            }
        }

        let polls = [
            ("gpio", self.sources.gpio.poll_interval_ms),
            ("rotary", self.sources.rotary.poll_interval_ms),
            ("touch", self.sources.touch.poll_interval_ms),
        ];
        if let Some((name, _)) = polls.iter().find(|(_, ms)| *ms == 0) {
            return Err(invalid(format!(
                "sources.{name}.poll_interval_ms must be at least 1"
            )));
        }
        Ok(())
    }

    pub fn source_enabled(&self, source: SourceKind) -> bool {
        match source {
            SourceKind::Gpio => self.sources.gpio.enabled,
            SourceKind::Rotary => self.sources.rotary.enabled,
            SourceKind::Touch => self.sources.touch.enabled,
            SourceKind::Ir => self.sources.ir.enabled,
        }
    }

    /// Sampling period of polled sources. IR is event driven and reports `None`.
    pub fn poll_interval(&self, source: SourceKind) -> Option<Duration> {
        let ms = match source {
            SourceKind::Gpio => self.sources.gpio.poll_interval_ms,
            SourceKind::Rotary => self.sources.rotary.poll_interval_ms,
            SourceKind::Touch => self.sources.touch.poll_interval_ms,
            SourceKind::Ir => return None,
        };
        Some(Duration::from_millis(ms))
    }

    /// Typed bindings of every source.
    pub fn physical_bindings(&self) -> Result<Vec<PhysicalBinding>, ConfigError> {
        let mut out = Vec::new();
        for source in SourceKind::ALL {
            for (code, key) in self.bindings.get(source) {
                let code = Code::parse(source, code)?;
                out.push(PhysicalBinding::new(source, code, key.clone()));
            }
        }
        Ok(out)
    }

    /// Build the binding table. Two codes bound to the same key within one source
    /// are rejected.
    pub fn keymap(&self) -> Result<KeyMap, ConfigError> {
        Ok(KeyMap::from_bindings(self.physical_bindings()?)?)
    }

    /// Replace the binding tables with the contents of `map`.
    pub fn set_bindings(&mut self, map: &KeyMap) {
        for source in SourceKind::ALL {
            let table = self.bindings.get_mut(source);
            table.clear();
            table.extend(map.bindings(source).map(|b| (b.code.to_string(), b.key)));
        }
    }

    /// Classifier timings of one source, including per-key overrides.
    pub fn timings(&self, source: SourceKind) -> TimingTable {
        let (long_press_ms, repeat_ms) = match source {
            SourceKind::Gpio => (self.sources.gpio.long_press_ms, self.sources.gpio.repeat_ms),
            SourceKind::Rotary => (
                self.sources.rotary.long_press_ms,
                self.sources.rotary.repeat_ms,
            ),
            SourceKind::Touch => (
                self.sources.touch.long_press_ms,
                self.sources.touch.repeat_ms,
            ),
            SourceKind::Ir => (self.sources.ir.long_press_ms, self.sources.ir.repeat_ms),
        };
        let mut table = TimingTable::new(Timing::from_millis(long_press_ms, repeat_ms));
        for (key, over) in &self.keys {
            if over.long_press_ms.is_none() && over.repeat_ms.is_none() {
                continue;
            }
            let timing = Timing::from_millis(
                over.long_press_ms.unwrap_or(long_press_ms),
                over.repeat_ms.unwrap_or(repeat_ms),
            );
            table = table.with_key(key.clone(), timing);
        }
        table
    }

    /// Per-pin debounce windows for GPIO buttons whose key carries a
    /// `debounce_ms` override.
    pub fn gpio_debounce_overrides(&self) -> Vec<(u32, Duration)> {
        self.bindings
            .gpio
            .iter()
            .filter_map(|(code, key)| {
                let ms = self.keys.get(key)?.debounce_ms?;
                let Ok(Code::Pin(pin)) = Code::parse(SourceKind::Gpio, code) else {
                    return None;
                };
                Some((pin, Duration::from_millis(ms)))
            })
            .collect()
    }

    pub fn encoders(&self) -> Vec<EncoderPins> {
        self.sources
            .rotary
            .encoders
            .iter()
            .map(|e| EncoderPins {
                id: e.id,
                pin_a: e.pin_a,
                pin_b: e.pin_b,
                steps_per_detent: e.steps_per_detent,
            })
            .collect()
    }

    /// Source-wide thresholds and per-pad overrides.
    pub fn pad_thresholds(
        &self,
    ) -> Result<(PadThresholds, HashMap<u8, PadThresholds>), ConfigError> {
        let defaults = PadThresholds {
            touch: self.sources.touch.touch_threshold,
            release: self.sources.touch.release_threshold,
        };
        check_thresholds("sources.touch", defaults)?;

        let mut overrides = HashMap::new();
        for (name, pad) in &self.touch.pads {
            let index = parse_pad(name)?;
            let merged = PadThresholds {
                touch: pad.touch_threshold.unwrap_or(defaults.touch),
                release: pad.release_threshold.unwrap_or(defaults.release),
            };
            check_thresholds(&format!("touch.pads.{name}"), merged)?;
            overrides.insert(index, merged);
        }
        Ok((defaults, overrides))
    }

    pub fn gesture_window(&self) -> Duration {
        Duration::from_millis(self.touch.gestures.window_ms)
    }

    /// Expand the configured gesture patterns.
    pub fn gestures(&self) -> Result<Vec<Gesture>, ConfigError> {
        let mut out = Vec::new();
        for entry in &self.touch.gestures.patterns {
            match entry {
                GestureConfig::Swipe { pads, key } => {
                    check_swipe(pads)?;
                    out.push(Gesture {
                        pattern: GesturePattern::Swipe { pads: pads.clone() },
                        key: key.clone(),
                    });
                }
                GestureConfig::SwipeBoth {
                    pads,
                    key,
                    reverse_key,
                } => {
                    check_swipe(pads)?;
                    let reversed: Vec<u8> = pads.iter().rev().copied().collect();
                    out.push(Gesture {
                        pattern: GesturePattern::Swipe { pads: pads.clone() },
                        key: key.clone(),
                    });
                    out.push(Gesture {
                        pattern: GesturePattern::Swipe { pads: reversed },
                        key: reverse_key.clone(),
                    });
                }
                GestureConfig::MultiTap { pad, count, key } => {
                    if *pad >= PAD_COUNT {
                        return Err(invalid(format!("multi_tap pad {pad} out of range")));
                    }
                    if *count < 2 {
                        return Err(invalid(format!(
                            "multi_tap on pad {pad} needs a count of at least 2"
                        )));
                    }
                    out.push(Gesture {
                        pattern: GesturePattern::MultiTap {
                            pad: *pad,
                            count: *count,
                        },
                        key: key.clone(),
                    });
                }
            }
        }
        if !out.is_empty() && self.touch.gestures.window_ms == 0 {
            return Err(invalid("touch.gestures.window_ms must be at least 1"));
        }
        Ok(out)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        let tie_break = match self.publisher.tie_break {
            TieBreakPolicy::SourcePriority => {
                TieBreak::SourcePriority(self.publisher.priority.clone())
            }
            TieBreakPolicy::Arrival => TieBreak::Arrival,
        };
        PublisherConfig {
            queue_depth: self.publisher.queue_depth,
            tie_break,
            reorder_window: Duration::from_millis(self.publisher.reorder_ms),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn parse_pad(name: &str) -> Result<u8, ConfigError> {
    match Code::parse(SourceKind::Touch, name)? {
        Code::Pad(index) => Ok(index),
        _ => Err(invalid(format!("touch pad {name:?} is not a pad index"))),
    }
}

fn check_thresholds(section: &str, t: PadThresholds) -> Result<(), ConfigError> {
    if t.release >= t.touch {
        return Err(invalid(format!(
            "{section}: release threshold {} must be below touch threshold {}",
            t.release, t.touch
        )));
    }
    Ok(())
}

fn check_swipe(pads: &[u8]) -> Result<(), ConfigError> {
    if pads.len() < 2 {
        return Err(invalid("a swipe needs at least two pads"));
    }
    if let Some(pad) = pads.iter().find(|p| **p >= PAD_COUNT) {
        return Err(invalid(format!("swipe pad {pad} out of range")));
    }
    Ok(())
}
