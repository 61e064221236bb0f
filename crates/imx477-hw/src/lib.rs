//! imx477-hw: raw capture and Bayer processing for the Sony IMX477.
//!
//! Drives the sensor through a [`SensorBackend`] (V4L2 by default,
//! libcamera behind the `libcamera` feature) and turns raw mosaics into
//! binned 16-bit mono images or downscaled colour previews.

pub mod binning;
pub mod camera;
pub mod controls;
pub mod frame;
pub mod latest;
#[cfg(feature = "libcamera")]
pub mod libcamera;
pub mod modes;
pub mod preview;
pub mod tuning;
pub mod v4l2;

pub use binning::{monobin, ProcessingParams};
pub use camera::{Camera, CameraError, SensorBackend, SessionConfig};
pub use controls::{CaptureOptions, MonobinMode, SensorControls};
pub use frame::{BayerFrame, CfaPattern, Frame, FrameError, MaxAdu};
pub use modes::{ModeError, SensorMode};
pub use preview::preview;
pub use tuning::{TuningError, TuningProfile};
pub use v4l2::V4l2Backend;
