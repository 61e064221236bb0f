//! Camera session: sensor lifecycle, control updates, capture-and-transform.

use crate::binning::{self, ProcessingParams};
use crate::controls::{CaptureOptions, SensorControls};
use crate::frame::{BayerFrame, Frame, FrameError, MaxAdu};
use crate::modes::{self, ModeError, SensorMode};
use crate::preview;
use crate::tuning::TuningError;
use image::DynamicImage;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("failed to apply controls: {0}")]
    ControlFailed(String),
    #[error("stream not started")]
    NotStreaming,
    #[error(transparent)]
    Mode(#[from] ModeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Tuning(#[from] TuningError),
}

/// The vendor camera stack seen from a [`Camera`] session.
///
/// Lifecycle: `configure` → `start` → `capture_raw`* → `stop` → `close`.
/// `stop`/`start` may be repeated while the session is open.
pub trait SensorBackend {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn configure(&mut self, mode: &SensorMode, buffer_count: u32) -> Result<(), CameraError>;

    fn start(&mut self) -> Result<(), CameraError>;

    fn stop(&mut self) -> Result<(), CameraError>;

    fn apply_controls(&mut self, controls: &SensorControls) -> Result<(), CameraError>;

    /// Block until the next raw frame is available.
    fn capture_raw(&mut self) -> Result<BayerFrame, CameraError>;

    /// Release the device. Called once, after `stop`.
    fn close(&mut self) -> Result<(), CameraError> {
        Ok(())
    }
}

impl<B: SensorBackend + ?Sized> SensorBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn configure(&mut self, mode: &SensorMode, buffer_count: u32) -> Result<(), CameraError> {
        (**self).configure(mode, buffer_count)
    }

    fn start(&mut self) -> Result<(), CameraError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        (**self).stop()
    }

    fn apply_controls(&mut self, controls: &SensorControls) -> Result<(), CameraError> {
        (**self).apply_controls(controls)
    }

    fn capture_raw(&mut self) -> Result<BayerFrame, CameraError> {
        (**self).capture_raw()
    }

    fn close(&mut self) -> Result<(), CameraError> {
        (**self).close()
    }
}

/// Session parameters fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    /// Index into the sensor mode table.
    pub sensor_mode: usize,
    pub buffer_count: u32,
    /// Wait after the first start for AE/AGC to settle.
    pub start_settle: Duration,
    /// Wait after a stream restart.
    pub restart_settle: Duration,
    /// Height of the recording crop window.
    pub crop_height: u32,
    pub processing: ProcessingParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "IMX477".to_string(),
            sensor_mode: modes::DEFAULT_MODE,
            buffer_count: 10,
            start_settle: Duration::from_secs(2),
            restart_settle: Duration::from_secs(1),
            crop_height: 220,
            processing: ProcessingParams::default(),
        }
    }
}

/// One camera session. Unset until [`init`](Camera::init); every operation
/// on an unset session is a silent no-op.
pub struct Camera<B: SensorBackend> {
    backend: Option<B>,
    config: SessionConfig,
    mode: Option<SensorMode>,
    /// Controls most recently pushed to the backend.
    controls: Option<SensorControls>,
    options: CaptureOptions,
    max_adu: MaxAdu,
}

impl<B: SensorBackend> Camera<B> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            backend: None,
            config,
            mode: None,
            controls: None,
            options: CaptureOptions::default(),
            max_adu: MaxAdu::default(),
        }
    }

    /// Open the session on `backend`: select the configured sensor mode,
    /// start streaming and wait for the sensor to settle.
    ///
    /// Returns the sensor output size.
    pub fn init(&mut self, mut backend: B) -> Result<(u32, u32), CameraError> {
        let mode = modes::mode(self.config.sensor_mode)?.clone();

        backend.configure(&mode, self.config.buffer_count)?;
        backend.start()?;
        tracing::info!(
            backend = backend.name(),
            mode = mode.index,
            width = mode.width,
            height = mode.height,
            bit_depth = mode.bit_depth,
            "camera streaming"
        );
        settle(self.config.start_settle);

        let size = (mode.width, mode.height);
        self.mode = Some(mode);
        self.backend = Some(backend);
        Ok(size)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Per-channel peaks of the last non-recording capture.
    pub fn max_adu(&self) -> MaxAdu {
        self.max_adu
    }

    pub fn is_color(&self) -> bool {
        true
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn sensor_mode(&self) -> Option<&SensorMode> {
        self.mode.as_ref()
    }

    pub fn sensor_size(&self) -> Option<(u32, u32)> {
        self.mode.as_ref().map(|m| (m.width, m.height))
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Controls most recently applied, if any.
    pub fn controls(&self) -> Option<&SensorControls> {
        self.controls.as_ref()
    }

    /// Push `options` to the sensor and keep them for the following
    /// captures.
    ///
    /// A stream still running a long exposure (see
    /// [`SensorControls::needs_restart`]) is stopped first and restarted
    /// once the new controls are in.
    pub fn update_controls(&mut self, options: &CaptureOptions) -> Result<(), CameraError> {
        let Some(backend) = self.backend.as_mut() else {
            tracing::debug!("update_controls without an open session");
            return Ok(());
        };

        let restart = self
            .controls
            .as_ref()
            .is_some_and(SensorControls::needs_restart);
        if restart {
            tracing::debug!("stopping stream for long-exposure control change");
            backend.stop()?;
        }

        let controls = SensorControls::from_options(options);
        backend.apply_controls(&controls)?;
        tracing::debug!(
            exposure_us = controls.exposure_time.as_micros() as u64,
            gain = controls.analogue_gain,
            ae = controls.ae_enable,
            "controls applied"
        );

        if restart {
            backend.start()?;
            settle(self.config.restart_settle);
        }

        self.controls = Some(controls);
        self.options = options.clone();
        Ok(())
    }

    /// Capture one frame and transform it according to the current options.
    ///
    /// Returns `Ok(None)` when no session is open. Outside of recording the
    /// per-channel peaks of the region are refreshed.
    pub fn capture(&mut self, is_recording: bool) -> Result<Option<Frame>, CameraError> {
        let Some(backend) = self.backend.as_mut() else {
            tracing::debug!("capture without an open session");
            return Ok(None);
        };
        let raw = backend.capture_raw()?;
        let region = self.region_of_interest(&raw);

        if !is_recording {
            self.max_adu = region.max_adu();
        }

        let params = &self.config.processing;
        let image = if self.options.monobin {
            DynamicImage::ImageLuma16(binning::monobin(
                &region,
                self.options.monobin_mode,
                self.options.bin,
                params,
            )?)
        } else {
            DynamicImage::ImageRgb16(preview::preview(&region, params.preview_downscale)?)
        };

        Ok(Some(Frame {
            image,
            timestamp: raw.timestamp,
            sequence: raw.sequence,
        }))
    }

    /// Full-width band of rows selected by the crop options.
    fn region_of_interest(&self, raw: &BayerFrame) -> BayerFrame {
        if self.options.crop {
            raw.crop_rows(self.options.crop_y, self.config.crop_height)
        } else {
            raw.crop_rows(
                self.options.preview_crop_y,
                self.options.preview_crop_height,
            )
        }
    }

    /// Stop streaming and close the session.
    pub fn stop(&mut self) -> Result<(), CameraError> {
        let Some(mut backend) = self.backend.take() else {
            return Ok(());
        };
        self.controls = None;
        let stopped = backend.stop();
        if let Err(e) = &stopped {
            tracing::warn!(error = %e, "failed to stop stream, closing anyway");
        }
        let closed = backend.close();
        tracing::info!(backend = backend.name(), "camera closed");
        stopped.and(closed)
    }
}

impl<B: SensorBackend> Drop for Camera<B> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to stop camera on drop");
        }
    }
}

fn settle(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::MonobinMode;
    use crate::frame::CfaPattern;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Backend that serves a fixed mosaic and records every call.
    struct MockBackend {
        calls: Rc<RefCell<Vec<String>>>,
        width: u32,
        height: u32,
        sequence: u32,
        fail_stop: bool,
    }

    impl MockBackend {
        fn new(calls: &Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                calls: Rc::clone(calls),
                width: 0,
                height: 0,
                sequence: 0,
                fail_stop: false,
            }
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.borrow_mut().push(call.into());
        }
    }

    impl SensorBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn configure(&mut self, mode: &SensorMode, buffer_count: u32) -> Result<(), CameraError> {
            self.width = mode.width;
            self.height = mode.height;
            self.log(format!("configure {} {buffer_count}", mode.index));
            Ok(())
        }

        fn start(&mut self) -> Result<(), CameraError> {
            self.log("start");
            Ok(())
        }

        fn stop(&mut self) -> Result<(), CameraError> {
            self.log("stop");
            if self.fail_stop {
                return Err(CameraError::CaptureFailed("stop failed".into()));
            }
            Ok(())
        }

        fn apply_controls(&mut self, controls: &SensorControls) -> Result<(), CameraError> {
            self.log(format!("controls {}", controls.exposure_time.as_micros()));
            Ok(())
        }

        fn capture_raw(&mut self) -> Result<BayerFrame, CameraError> {
            self.log("capture");
            self.sequence += 1;
            // R=1000 G=600 B=300 everywhere, except row 1 where R doubles
            let (w, h) = (self.width, self.height);
            let data = (0..h)
                .flat_map(|y| {
                    (0..w).map(move |x| match (y % 2, x % 2) {
                        (0, 0) if y == 0 => 2000,
                        (0, 0) => 1000,
                        (1, 1) => 300,
                        _ => 600,
                    })
                })
                .collect();
            let mut frame = BayerFrame::new(data, w, h, CfaPattern::Rggb, 12)?;
            frame.sequence = self.sequence;
            Ok(frame)
        }

        fn close(&mut self) -> Result<(), CameraError> {
            self.log("close");
            Ok(())
        }
    }

    fn quick_config(mode: usize) -> SessionConfig {
        SessionConfig {
            sensor_mode: mode,
            start_settle: Duration::ZERO,
            restart_settle: Duration::ZERO,
            crop_height: 4,
            ..Default::default()
        }
    }

    fn open(mode: usize) -> (Camera<MockBackend>, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut camera = Camera::new(quick_config(mode));
        camera.init(MockBackend::new(&calls)).unwrap();
        (camera, calls)
    }

    #[test]
    fn test_unset_session_is_silent() {
        let mut camera: Camera<MockBackend> = Camera::new(quick_config(0));
        assert!(!camera.is_open());
        assert!(camera.update_controls(&CaptureOptions::default()).is_ok());
        assert!(camera.capture(false).unwrap().is_none());
        assert!(camera.stop().is_ok());
        assert_eq!(camera.max_adu(), MaxAdu::default());
    }

    #[test]
    fn test_init_selects_mode_and_starts() {
        let (camera, calls) = open(0);
        assert_eq!(camera.sensor_size(), Some((1332, 990)));
        assert_eq!(camera.name(), "IMX477");
        assert!(camera.is_color());
        assert_eq!(*calls.borrow(), vec!["configure 0 10", "start"]);
    }

    #[test]
    fn test_init_unknown_mode() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut camera = Camera::new(quick_config(42));
        let result = camera.init(MockBackend::new(&calls));
        assert!(matches!(result, Err(CameraError::Mode(_))));
        assert!(!camera.is_open());
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_short_exposure_no_restart() {
        let (mut camera, calls) = open(0);
        let opts = CaptureOptions {
            exposure_time: 500_000,
            ..Default::default()
        };
        camera.update_controls(&opts).unwrap();
        camera.update_controls(&opts).unwrap();
        assert_eq!(
            calls.borrow()[2..],
            ["controls 500000".to_string(), "controls 500000".to_string()]
        );
    }

    #[test]
    fn test_long_exposure_restarts_on_next_update() {
        let (mut camera, calls) = open(0);
        let long = CaptureOptions {
            exposure_time: 2_000_000,
            ..Default::default()
        };
        let short = CaptureOptions {
            exposure_time: 10_000,
            ..Default::default()
        };
        // the first long exposure has nothing running long yet
        camera.update_controls(&long).unwrap();
        camera.update_controls(&short).unwrap();
        camera.update_controls(&short).unwrap();
        assert_eq!(
            calls.borrow()[2..],
            [
                "controls 2000000",
                "stop",
                "controls 10000",
                "start",
                "controls 10000"
            ]
            .map(String::from)
        );
    }

    #[test]
    fn test_preview_capture_updates_max_adu() {
        let (mut camera, _) = open(0);
        camera
            .update_controls(&CaptureOptions {
                preview_crop_y: 2,
                preview_crop_height: 16,
                ..Default::default()
            })
            .unwrap();

        let frame = camera.capture(false).unwrap().unwrap();
        assert!(!frame.is_mono());
        assert_eq!((frame.width(), frame.height()), (1332 / 4, 4));
        assert_eq!(frame.sequence, 1);
        assert_eq!(camera.max_adu(), MaxAdu { r: 1000, g: 600, b: 300 });
    }

    #[test]
    fn test_recording_capture_keeps_max_adu() {
        let (mut camera, _) = open(0);
        camera
            .update_controls(&CaptureOptions {
                monobin: true,
                crop: true,
                crop_y: 0,
                ..Default::default()
            })
            .unwrap();
        camera.capture(true).unwrap().unwrap();
        assert_eq!(camera.max_adu(), MaxAdu::default());

        camera.capture(false).unwrap().unwrap();
        assert_eq!(camera.max_adu().r, 2000);
    }

    #[test]
    fn test_monobin_capture_uses_recording_crop() {
        let (mut camera, _) = open(0);
        camera
            .update_controls(&CaptureOptions {
                monobin: true,
                monobin_mode: MonobinMode::Blue,
                crop: true,
                crop_y: 2,
                ..Default::default()
            })
            .unwrap();

        let frame = camera.capture(true).unwrap().unwrap();
        assert!(frame.is_mono());
        // crop_height 4 → blue plane of 2 rows
        assert_eq!((frame.width(), frame.height()), (666, 2));
        let img = frame.image.as_luma16().unwrap();
        assert_eq!(img.get_pixel(0, 0).0[0], (300 - 200) * 4);
    }

    #[test]
    fn test_stop_closes_once() {
        let (mut camera, calls) = open(0);
        camera.stop().unwrap();
        camera.stop().unwrap();
        assert!(!camera.is_open());
        assert_eq!(calls.borrow()[2..], ["stop".to_string(), "close".to_string()]);
        assert!(camera.capture(false).unwrap().is_none());
    }

    #[test]
    fn test_stop_closes_even_when_stop_fails() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut camera = Camera::new(quick_config(0));
        let mut backend = MockBackend::new(&calls);
        backend.fail_stop = true;
        camera.init(backend).unwrap();
        camera.update_controls(&CaptureOptions::default()).unwrap();

        let result = camera.stop();
        assert!(matches!(result, Err(CameraError::CaptureFailed(_))));
        assert!(!camera.is_open());
        assert!(camera.controls().is_none());
        let calls = calls.borrow();
        assert_eq!(calls[calls.len() - 2..], ["stop", "close"].map(String::from));
    }
}
