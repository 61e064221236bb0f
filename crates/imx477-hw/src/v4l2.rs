//! Raw V4L2 capture via the `v4l` crate.
//!
//! Frames come straight from the CSI-2 receiver's video node as unpacked
//! 16-bit Bayer samples. Exposure, gain and blanking are set on the sensor
//! sub-device. This path bypasses the ISP, so auto-exposure, white balance
//! and the tuning profile have no effect here.

use crate::camera::{CameraError, SensorBackend};
use crate::controls::SensorControls;
use crate::frame::{BayerFrame, CfaPattern};
use crate::modes::{self, SensorMode};
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

pub const V4L2_CID_EXPOSURE: u32 = 0x0098_0911;
pub const V4L2_CID_VBLANK: u32 = 0x009e_0901;
pub const V4L2_CID_ANALOGUE_GAIN: u32 = 0x009e_0903;

/// Highest gain code the IMX477 accepts (about 22x).
const MAX_GAIN_CODE: i64 = 978;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// IMX477 analogue gain code for a linear gain: `1024 - 1024 / gain`.
pub fn gain_code(gain: f32) -> i64 {
    if gain <= 1.0 {
        return 0;
    }
    let code = (1024.0 - 1024.0 / gain as f64).round() as i64;
    code.clamp(0, MAX_GAIN_CODE)
}

/// Frame length in lines that fits `controls` in `mode`: long enough for the
/// exposure plus `margin` and the minimum frame duration, capped at the
/// maximum frame duration.
pub fn frame_length_lines(
    mode: &SensorMode,
    controls: &SensorControls,
    pixel_rate: u64,
    margin: u32,
) -> i64 {
    let exposure = mode.exposure_lines(controls.exposure_time, pixel_rate) as i64;
    let (min_d, max_d) = controls.frame_duration_limits;
    let shortest = mode.exposure_lines(min_d, pixel_rate) as i64;
    let longest = mode.exposure_lines(max_d, pixel_rate) as i64;
    (exposure + margin as i64)
        .max(shortest)
        .max(mode.height as i64 + margin as i64)
        .min(longest.max(shortest))
}

/// V4L2 raw capture backend.
pub struct V4l2Backend {
    device: Device,
    device_path: String,
    subdev: Option<Device>,
    pattern: CfaPattern,
    pixel_rate: u64,
    exposure_margin: u32,
    mode: Option<SensorMode>,
    stride: usize,
    buffer_count: u32,
    stream: Option<MmapStream<'static>>,
}

impl V4l2Backend {
    /// Open the receiver's video node (e.g. "/dev/video0"). The sensor
    /// sub-device is taken from `subdev_path` or looked up by sensor name.
    pub fn open(device_path: &str, subdev_path: Option<&str>) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let info = modes::sensor_info()?;
        let subdev_path = match subdev_path {
            Some(p) => Some(p.to_string()),
            None => find_sensor_subdev(&info.model),
        };
        let subdev = match &subdev_path {
            Some(p) => Some(Device::with_path(p).map_err(|e| {
                CameraError::DeviceNotFound(format!("{p}: {e}"))
            })?),
            None => {
                tracing::warn!(
                    sensor = %info.model,
                    "no sensor sub-device found; exposure and gain will not be set"
                );
                None
            }
        };

        tracing::info!(
            device = device_path,
            subdev = subdev_path.as_deref().unwrap_or("-"),
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            subdev,
            pattern: info.pattern,
            pixel_rate: info.pixel_rate,
            exposure_margin: info.exposure_margin,
            mode: None,
            stride: 0,
            buffer_count: 4,
            stream: None,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    fn set_control(subdev: &Device, id: u32, value: i64) -> Result<(), CameraError> {
        subdev
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|e| CameraError::ControlFailed(format!("control {id:#x}: {e}")))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl SensorBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn configure(&mut self, mode: &SensorMode, buffer_count: u32) -> Result<(), CameraError> {
        let fourcc = match mode.bit_depth {
            10 => FourCC::new(b"RG10"),
            _ => FourCC::new(b"RG12"),
        };

        let mut fmt = self.device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = fourcc;
        fmt.width = mode.width;
        fmt.height = mode.height;

        let negotiated = self.device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        if negotiated.fourcc != fourcc
            || negotiated.width != mode.width
            || negotiated.height != mode.height
        {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "driver chose {}x{} {:?}, need {}x{} {:?}",
                negotiated.width, negotiated.height, negotiated.fourcc, mode.width, mode.height, fourcc
            )));
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            stride = negotiated.stride,
            fourcc = ?fourcc,
            "negotiated format"
        );

        self.stride = negotiated.stride as usize;
        self.buffer_count = buffer_count;
        self.mode = Some(mode.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.mode.is_none() {
            return Err(CameraError::FormatNegotiationFailed(
                "start before configure".into(),
            ));
        }
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, self.buffer_count)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        // Dropping the stream turns streaming off and releases the buffers.
        self.stream = None;
        Ok(())
    }

    fn apply_controls(&mut self, controls: &SensorControls) -> Result<(), CameraError> {
        let Some(subdev) = &self.subdev else {
            return Ok(());
        };
        let mode = self.mode.as_ref().ok_or(CameraError::NotStreaming)?;
        if controls.ae_enable {
            tracing::debug!("auto-exposure requested but unavailable on raw path");
        }

        let descs = subdev
            .query_controls()
            .map_err(|e| CameraError::ControlFailed(format!("failed to query controls: {e}")))?;
        let clamp_to = |id: u32, v: i64| {
            descs
                .iter()
                .find(|d| d.id == id)
                .map(|d| v.clamp(d.minimum, d.maximum))
                .unwrap_or(v)
        };

        let frame_lines =
            frame_length_lines(mode, controls, self.pixel_rate, self.exposure_margin);
        let vblank = clamp_to(V4L2_CID_VBLANK, frame_lines - mode.height as i64);
        let exposure = clamp_to(
            V4L2_CID_EXPOSURE,
            mode.exposure_lines(controls.exposure_time, self.pixel_rate) as i64,
        );
        let gain = clamp_to(V4L2_CID_ANALOGUE_GAIN, gain_code(controls.analogue_gain));

        // Blanking first: the driver derives the exposure range from it.
        Self::set_control(subdev, V4L2_CID_VBLANK, vblank)?;
        Self::set_control(subdev, V4L2_CID_EXPOSURE, exposure)?;
        Self::set_control(subdev, V4L2_CID_ANALOGUE_GAIN, gain)?;

        let interval = frame_interval(mode, frame_lines.max(0) as u32, self.pixel_rate);
        tracing::debug!(
            vblank,
            exposure_lines = exposure,
            gain_code = gain,
            frame_ms = interval.as_millis() as u64,
            "sensor controls set"
        );
        Ok(())
    }

    fn capture_raw(&mut self) -> Result<BayerFrame, CameraError> {
        let mode = self.mode.as_ref().ok_or(CameraError::NotStreaming)?;
        let stream = self.stream.as_mut().ok_or(CameraError::NotStreaming)?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let mut frame = BayerFrame::from_le_bytes(
            buf,
            mode.width,
            mode.height,
            self.stride,
            self.pattern,
            mode.bit_depth,
        )?;
        frame.sequence = meta.sequence;
        Ok(frame)
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.stream = None;
        self.mode = None;
        Ok(())
    }
}

/// Find the `/dev/v4l-subdevN` node whose sysfs name starts with `sensor`.
pub fn find_sensor_subdev(sensor: &str) -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/video4linux").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with("v4l-subdev") {
            continue;
        }
        let Ok(dev_name) = std::fs::read_to_string(entry.path().join("name")) else {
            continue;
        };
        if dev_name.trim().starts_with(sensor) {
            return Some(format!("/dev/{name}"));
        }
    }
    None
}

/// Nominal frame interval at the given frame length.
pub fn frame_interval(mode: &SensorMode, frame_lines: u32, pixel_rate: u64) -> Duration {
    mode.line_time(pixel_rate) * frame_lines
}
