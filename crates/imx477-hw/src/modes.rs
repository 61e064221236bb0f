//! Sensor mode table.
//!
//! The IMX477 readout modes are embedded at compile time from
//! `contrib/sensors/imx477.toml` and parsed once on first use.

use crate::frame::CfaPattern;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

const IMX477_MODES: &str = include_str!("../../../contrib/sensors/imx477.toml");

/// Mode used when the caller does not pick one: full resolution, 12-bit.
pub const DEFAULT_MODE: usize = 3;

static SENSOR_DB: OnceLock<Option<SensorTable>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("unknown sensor mode {0} (sensor has {1} modes)")]
    UnknownMode(usize, usize),
    #[error("sensor mode table unavailable")]
    TableUnavailable,
}

/// Top-level structure of the embedded mode file.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorTable {
    pub sensor: SensorInfo,
    pub modes: Vec<SensorMode>,
}

/// Sensor-wide constants from the `[sensor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorInfo {
    pub model: String,
    /// Pixel clock in pixels per second.
    pub pixel_rate: u64,
    /// Native CFA layout of the raw stream.
    pub pattern: CfaPattern,
    pub exposure_margin: u32,
}

/// One readout mode from a `[[modes]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorMode {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub format: String,
    /// Sensor area read out for this mode: x, y, width, height.
    pub crop: [u32; 4],
    pub max_fps: f64,
    /// Minimum line length in pixel clocks, including horizontal blanking.
    pub line_length: u32,
}

impl SensorMode {
    /// Duration of one sensor line at the given pixel rate.
    pub fn line_time(&self, pixel_rate: u64) -> Duration {
        if pixel_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.line_length as u64 * 1_000_000_000 / pixel_rate)
    }

    /// Number of whole lines covering `exposure`, at least one.
    pub fn exposure_lines(&self, exposure: Duration, pixel_rate: u64) -> u32 {
        let line_ns = self.line_time(pixel_rate).as_nanos();
        if line_ns == 0 {
            return 1;
        }
        let lines = exposure.as_nanos() / line_ns;
        lines.clamp(1, u32::MAX as u128) as u32
    }

    /// Whether the mode crops the sensor rather than reading the full area.
    pub fn is_cropped(&self) -> bool {
        self.crop[0] != 0 || self.crop[1] != 0
    }
}

fn sensor_db() -> Option<&'static SensorTable> {
    SENSOR_DB
        .get_or_init(|| match toml::from_str::<SensorTable>(IMX477_MODES) {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::error!(error = %e, "bad sensor mode TOML");
                None
            }
        })
        .as_ref()
}

/// Sensor-wide constants.
pub fn sensor_info() -> Result<&'static SensorInfo, ModeError> {
    sensor_db()
        .map(|t| &t.sensor)
        .ok_or(ModeError::TableUnavailable)
}

/// All known modes, in enumeration order.
pub fn sensor_modes() -> &'static [SensorMode] {
    sensor_db().map(|t| t.modes.as_slice()).unwrap_or(&[])
}

/// Look up a mode by its enumeration index.
pub fn mode(index: usize) -> Result<&'static SensorMode, ModeError> {
    let modes = sensor_modes();
    modes
        .iter()
        .find(|m| m.index == index)
        .ok_or(ModeError::UnknownMode(index, modes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_parses() {
        let info = sensor_info().unwrap();
        assert_eq!(info.model, "imx477");
        assert_eq!(info.pattern, CfaPattern::Rggb);
        assert_eq!(sensor_modes().len(), 4);
    }

    #[test]
    fn test_default_mode_is_full_resolution() {
        let m = mode(DEFAULT_MODE).unwrap();
        assert_eq!((m.width, m.height), (4056, 3040));
        assert_eq!(m.bit_depth, 12);
        assert!(!m.is_cropped());
    }

    #[test]
    fn test_unknown_mode() {
        assert!(matches!(mode(9), Err(ModeError::UnknownMode(9, 4))));
    }

    #[test]
    fn test_line_time_full_resolution() {
        let m = mode(3).unwrap();
        // 24000 px / 840 MHz
        assert_eq!(m.line_time(840_000_000), Duration::from_nanos(28_571));
    }

    #[test]
    fn test_exposure_lines() {
        let m = mode(3).unwrap();
        let lines = m.exposure_lines(Duration::from_millis(100), 840_000_000);
        assert_eq!(lines, 3500);
        assert_eq!(m.exposure_lines(Duration::ZERO, 840_000_000), 1);
    }

    #[test]
    fn test_binned_modes_keep_twelve_bits() {
        let m = mode(1).unwrap();
        assert!(m.is_cropped());
        assert_eq!(m.format, "SRGGB12");
        assert_eq!(mode(0).unwrap().bit_depth, 10);
    }
}
