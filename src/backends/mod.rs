//! Sampler backends for `keyrelay`.
//!
//! Implementations of [`Sampler`](crate::device::Sampler) for the physical sources.
//! The GPIO and MPR121 samplers are generic over `embedded-hal` traits; the
//! `linux` module supplies the concrete pins and bus.
//!
//! # Feature flags
//! - **`rpi`** (default) enables the Linux GPIO character device and I²C backend.
//!
//! IR always goes through the lircd socket and needs no feature.

use crate::config::Config;
use crate::device::Sampler;
use crate::event::{Code, SourceKind};
use std::collections::BTreeSet;
use tracing::{info, warn};

pub mod gpio;
pub mod lirc;
pub mod mpr121;
pub mod virtual_input;

#[cfg(all(feature = "rpi", target_os = "linux"))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "rpi", target_os = "linux"))))]
pub mod linux;

/// GPIO lines carrying bound buttons.
pub fn button_lines(config: &Config) -> Vec<u32> {
    config
        .bindings
        .gpio
        .keys()
        .filter_map(|code| match Code::parse(SourceKind::Gpio, code) {
            Ok(Code::Pin(pin)) => Some(pin),
            _ => None,
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A and B lines of every configured encoder.
pub fn encoder_lines(config: &Config) -> Vec<u32> {
    config
        .sources
        .rotary
        .encoders
        .iter()
        .flat_map(|e| [e.pin_a, e.pin_b])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Pads that are bound or take part in a gesture.
pub fn touch_pads(config: &Config) -> Vec<u8> {
    let mut pads = BTreeSet::new();
    for code in config.bindings.touch.keys() {
        if let Ok(Code::Pad(pad)) = Code::parse(SourceKind::Touch, code) {
            pads.insert(pad);
        }
    }
    for gesture in config.gestures().unwrap_or_default() {
        match gesture.pattern {
            crate::gesture::GesturePattern::Swipe { pads: seq } => pads.extend(seq),
            crate::gesture::GesturePattern::MultiTap { pad, .. } => {
                pads.insert(pad);
            }
        }
    }
    pads.into_iter().collect()
}

/// Hardware inputs the samplers of enabled sources read.
///
/// Samplers open their lines and pads once, so a configuration that needs inputs
/// outside the set opened at startup only takes full effect after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampledInputs {
    pub gpio_lines: BTreeSet<u32>,
    pub encoder_lines: BTreeSet<u32>,
    pub touch_pads: BTreeSet<u8>,
}

impl SampledInputs {
    pub fn from_config(config: &Config) -> Self {
        let mut inputs = Self::default();
        if config.source_enabled(SourceKind::Gpio) {
            inputs.gpio_lines.extend(button_lines(config));
        }
        if config.source_enabled(SourceKind::Rotary) {
            inputs.encoder_lines.extend(encoder_lines(config));
        }
        if config.source_enabled(SourceKind::Touch) {
            inputs.touch_pads.extend(touch_pads(config));
        }
        inputs
    }

    /// Inputs `wanted` needs that this set does not read.
    pub fn missing(&self, wanted: &SampledInputs) -> Vec<String> {
        let lines = wanted
            .gpio_lines
            .difference(&self.gpio_lines)
            .map(|l| format!("gpio line {l}"));
        let encoders = wanted
            .encoder_lines
            .difference(&self.encoder_lines)
            .map(|l| format!("encoder line {l}"));
        let pads = wanted
            .touch_pads
            .difference(&self.touch_pads)
            .map(|p| format!("touch pad {p}"));
        lines.chain(encoders).chain(pads).collect()
    }
}

/// Open a sampler for every enabled source.
///
/// A source whose hardware cannot be opened is skipped with a warning. The IR
/// and touch samplers connect lazily, so a missing lircd or an unpowered touch
/// board only degrades that source until it shows up.
pub fn probe_samplers(config: &Config) -> Vec<Box<dyn Sampler>> {
    let mut out: Vec<Box<dyn Sampler>> = Vec::new();

    if config.source_enabled(SourceKind::Ir) {
        out.push(Box::new(lirc::LircSampler::new(
            config.sources.ir.socket.clone(),
        )));
    }

    #[cfg(all(feature = "rpi", target_os = "linux"))]
    {
        if config.source_enabled(SourceKind::Gpio) {
            let lines = button_lines(config);
            if lines.is_empty() {
                warn!("gpio source enabled without bindings");
            } else {
                match linux::gpio_sampler(config, &lines) {
                    Ok(s) => out.push(Box::new(s)),
                    Err(e) => warn!(error = %e, "gpio source unavailable, skipping"),
                }
            }
        }
        if config.source_enabled(SourceKind::Rotary) {
            let lines = encoder_lines(config);
            if lines.is_empty() {
                warn!("rotary source enabled without encoders");
            } else {
                match linux::rotary_sampler(config, &lines) {
                    Ok(s) => out.push(Box::new(s)),
                    Err(e) => warn!(error = %e, "rotary source unavailable, skipping"),
                }
            }
        }
        if config.source_enabled(SourceKind::Touch) {
            match linux::touch_sampler(config, touch_pads(config)) {
                Ok(s) => out.push(Box::new(s)),
                Err(e) => warn!(error = %e, "touch source unavailable, skipping"),
            }
        }
    }

    #[cfg(not(all(feature = "rpi", target_os = "linux")))]
    for source in [SourceKind::Gpio, SourceKind::Rotary, SourceKind::Touch] {
        if config.source_enabled(source) {
            warn!(%source, "built without the `rpi` feature, source unavailable");
        }
    }

    info!(count = out.len(), "samplers probed");
    out
}
