//! Capture options supplied by the caller and the sensor controls derived
//! from them.

use crate::frame::Channel;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Shortest frame duration requested from the sensor.
pub const FRAME_DURATION_MIN: Duration = Duration::from_millis(150);
/// Longest frame duration requested from the sensor.
pub const FRAME_DURATION_MAX: Duration = Duration::from_secs(60);
/// Streams running exposures at or above this must be stopped before new
/// controls take effect.
pub const RESTART_EXPOSURE: Duration = Duration::from_secs(1);

/// What a monobin capture reduces the mosaic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "MonobinRepr")]
pub enum MonobinMode {
    /// Sum of whole mosaic blocks (all colours).
    #[default]
    Rgb,
    Red,
    /// Both green sites summed.
    Green,
    Blue,
}

impl MonobinMode {
    /// Colour layer this mode extracts, `None` for the full-block sum.
    pub fn channel(self) -> Option<Channel> {
        match self {
            Self::Rgb => None,
            Self::Red => Some(Channel::Red),
            Self::Green => Some(Channel::Green),
            Self::Blue => Some(Channel::Blue),
        }
    }
}

impl TryFrom<u8> for MonobinMode {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Rgb),
            1 => Ok(Self::Red),
            2 => Ok(Self::Green),
            3 => Ok(Self::Blue),
            other => Err(format!("monobin mode out of range: {other} (expected 0-3)")),
        }
    }
}

impl FromStr for MonobinMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u8>() {
            return Self::try_from(n);
        }
        match s.to_ascii_lowercase().as_str() {
            "rgb" | "mono" => Ok(Self::Rgb),
            "red" | "r" => Ok(Self::Red),
            "green" | "g" => Ok(Self::Green),
            "blue" | "b" => Ok(Self::Blue),
            other => Err(format!("unknown monobin mode: {other}")),
        }
    }
}

impl fmt::Display for MonobinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rgb => "rgb",
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MonobinRepr {
    Index(u8),
    Name(String),
}

impl TryFrom<MonobinRepr> for MonobinMode {
    type Error = String;

    fn try_from(repr: MonobinRepr) -> Result<Self, Self::Error> {
        match repr {
            MonobinRepr::Index(n) => Self::try_from(n),
            MonobinRepr::Name(s) => s.parse(),
        }
    }
}

/// Per-batch options from the caller. Every field has a default, so a
/// partial TOML/JSON record is enough.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Exposure time in microseconds.
    pub exposure_time: u64,
    /// Analogue gain, only honoured for monobin captures.
    pub gain: f32,
    /// Use the recording crop (`crop_y`, fixed height) instead of the
    /// preview crop.
    pub crop: bool,
    pub crop_y: u32,
    pub preview_crop_y: u32,
    pub preview_crop_height: u32,
    /// Produce binned 16-bit mono output instead of a colour preview.
    pub monobin: bool,
    pub monobin_mode: MonobinMode,
    /// Bin single-layer monobin output as well.
    pub bin: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            exposure_time: 100_000,
            gain: 1.0,
            crop: false,
            crop_y: 0,
            preview_crop_y: 0,
            preview_crop_height: 3040,
            monobin: false,
            monobin_mode: MonobinMode::Rgb,
            bin: false,
        }
    }
}

impl CaptureOptions {
    pub fn exposure(&self) -> Duration {
        Duration::from_micros(self.exposure_time)
    }
}

/// Controls pushed to the sensor stack.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorControls {
    pub ae_enable: bool,
    pub awb_enable: bool,
    pub frame_duration_limits: (Duration, Duration),
    pub exposure_time: Duration,
    pub analogue_gain: f32,
    pub contrast: f32,
    pub brightness: f32,
    pub noise_reduction: bool,
}

impl SensorControls {
    /// Monobin captures run manual exposure at the requested gain; previews
    /// keep auto-exposure at unity gain.
    pub fn from_options(options: &CaptureOptions) -> Self {
        Self {
            ae_enable: !options.monobin,
            awb_enable: false,
            frame_duration_limits: (FRAME_DURATION_MIN, FRAME_DURATION_MAX),
            exposure_time: options.exposure(),
            analogue_gain: if options.monobin { options.gain } else { 1.0 },
            contrast: 0.0,
            brightness: 0.0,
            noise_reduction: false,
        }
    }

    /// Whether a stream running with these controls must be restarted
    /// before different controls are applied.
    pub fn needs_restart(&self) -> bool {
        self.exposure_time >= RESTART_EXPOSURE
    }
}
