//! Raspberry Pi / Linux hardware: GPIO through the gpio character device and
//! I²C through `/dev/i2c-*`.

use crate::backends::gpio::PinSampler;
use crate::backends::mpr121::Mpr121Sampler;
use crate::config::Config;
use crate::device::SampleError;
use crate::event::SourceKind;
use gpio_cdev::{Chip, LineRequestFlags};
use linux_embedded_hal::{CdevPin, I2cdev};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const CONSUMER: &str = "keyrelay";

fn unavailable(what: impl std::fmt::Display, e: impl std::fmt::Display) -> SampleError {
    SampleError::Unavailable(format!("{what}: {e}"))
}

/// Request `lines` of `chip` as inputs.
pub fn open_lines(chip: &Path, lines: &[u32]) -> Result<Vec<(u32, CdevPin)>, SampleError> {
    let mut chip_handle = Chip::new(chip).map_err(|e| unavailable(chip.display(), e))?;
    let mut out = Vec::with_capacity(lines.len());
    for &line in lines {
        let what = format!("{} line {line}", chip.display());
        let handle = chip_handle
            .get_line(line)
            .and_then(|l| l.request(LineRequestFlags::INPUT, 0, CONSUMER))
            .map_err(|e| unavailable(&what, e))?;
        let pin = CdevPin::new(handle).map_err(|e| unavailable(&what, e))?;
        out.push((line, pin));
    }
    debug!(chip = %chip.display(), ?lines, "gpio lines requested");
    Ok(out)
}

pub fn gpio_sampler(config: &Config, lines: &[u32]) -> Result<PinSampler<CdevPin>, SampleError> {
    let settings = &config.sources.gpio;
    let pins = open_lines(&settings.chip, lines)?;
    Ok(PinSampler::new(
        SourceKind::Gpio,
        format!("gpio:{}", settings.chip.display()),
        pins,
        settings.active_low,
        Duration::from_millis(settings.poll_interval_ms),
    ))
}

/// Encoder A/B lines are read active-high.
pub fn rotary_sampler(config: &Config, lines: &[u32]) -> Result<PinSampler<CdevPin>, SampleError> {
    let settings = &config.sources.rotary;
    let pins = open_lines(&settings.chip, lines)?;
    Ok(PinSampler::new(
        SourceKind::Rotary,
        format!("rotary:{}", settings.chip.display()),
        pins,
        false,
        Duration::from_millis(settings.poll_interval_ms),
    ))
}

pub fn touch_sampler(config: &Config, pads: Vec<u8>) -> Result<Mpr121Sampler<I2cdev>, SampleError> {
    let settings = &config.sources.touch;
    let bus = I2cdev::new(&settings.i2c_bus).map_err(|e| unavailable(settings.i2c_bus.display(), e))?;
    Ok(Mpr121Sampler::new(
        bus,
        settings.address,
        pads,
        Duration::from_millis(settings.poll_interval_ms),
    )
    .with_name(format!(
        "touch:{}@0x{:02x}",
        settings.i2c_bus.display(),
        settings.address
    )))
}
