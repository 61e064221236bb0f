//! libcamera capture backend (feature `libcamera`).
//!
//! libcamera objects borrow from their `CameraManager`, so the whole
//! session lives on one worker thread. Commands go in over a channel; the
//! newest raw frame comes back through a [`Latest`] slot, so a capture never
//! returns a stale buffered frame. Stopping the stream ends the worker;
//! starting it again spawns a fresh one.

use crate::camera::{CameraError, SensorBackend};
use crate::controls::SensorControls;
use crate::frame::{BayerFrame, CfaPattern};
use crate::latest::Latest;
use crate::modes::{self, SensorMode};
use crate::tuning::{TuningProfile, TUNING_FILE_ENV};
use libcamera::{
    camera::CameraConfigurationStatus,
    camera_manager::CameraManager,
    control::ControlList,
    controls::{
        AeEnable, AnalogueGain, AwbEnable, Brightness, Contrast, ExposureTime,
        FrameDurationLimits, NoiseReductionMode,
    },
    framebuffer_allocator::{FrameBuffer, FrameBufferAllocator},
    framebuffer_map::MemoryMappedFrameBuffer,
    geometry::Size,
    pixel_format::PixelFormat,
    request::ReuseFlag,
    stream::StreamRole,
};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

type FrameResult = Result<BayerFrame, CameraError>;

enum Command {
    Controls(SensorControls),
    Shutdown,
}

struct Worker {
    commands: Sender<Command>,
    frames: Latest<FrameResult>,
    handle: JoinHandle<()>,
}

/// Raw capture through libcamera and the Raspberry Pi pipeline handler.
pub struct LibcameraBackend {
    camera_index: usize,
    tuning_file: Option<PathBuf>,
    pattern: CfaPattern,
    mode: Option<SensorMode>,
    buffer_count: u32,
    controls: Option<SensorControls>,
    worker: Option<Worker>,
}

impl LibcameraBackend {
    /// Prepare a session on the `camera_index`-th camera. A tuning profile,
    /// if given, is written out and handed to the IPA.
    pub fn open(
        camera_index: usize,
        tuning: Option<&TuningProfile>,
    ) -> Result<Self, CameraError> {
        let tuning_file = match tuning {
            Some(profile) => {
                let path = profile.persist()?;
                std::env::set_var(TUNING_FILE_ENV, &path);
                tracing::info!(path = %path.display(), "using tuning file");
                Some(path)
            }
            None => None,
        };

        Ok(Self {
            camera_index,
            tuning_file,
            pattern: modes::sensor_info()?.pattern,
            mode: None,
            buffer_count: 4,
            controls: None,
            worker: None,
        })
    }

    pub fn tuning_file(&self) -> Option<&PathBuf> {
        self.tuning_file.as_ref()
    }
}

impl SensorBackend for LibcameraBackend {
    fn name(&self) -> &str {
        "libcamera"
    }

    fn configure(&mut self, mode: &SensorMode, buffer_count: u32) -> Result<(), CameraError> {
        self.mode = Some(mode.clone());
        self.buffer_count = buffer_count;
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mode = self.mode.clone().ok_or_else(|| {
            CameraError::FormatNegotiationFailed("start before configure".into())
        })?;

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let frames = Latest::new();
        let frame_tx = frames.clone();
        if let Some(controls) = &self.controls {
            let _ = cmd_tx.send(Command::Controls(controls.clone()));
        }

        let setup = WorkerSetup {
            camera_index: self.camera_index,
            mode,
            pattern: self.pattern,
            buffer_count: self.buffer_count,
        };
        let handle = std::thread::Builder::new()
            .name("imx477-libcamera".into())
            .spawn(move || worker(setup, cmd_rx, frame_tx))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn worker: {e}")))?;

        self.worker = Some(Worker {
            commands: cmd_tx,
            frames,
            handle,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = worker.commands.send(Command::Shutdown);
        worker.frames.close();
        worker
            .handle
            .join()
            .map_err(|_| CameraError::CaptureFailed("libcamera worker panicked".into()))
    }

    fn apply_controls(&mut self, controls: &SensorControls) -> Result<(), CameraError> {
        self.controls = Some(controls.clone());
        if let Some(worker) = &self.worker {
            worker
                .commands
                .send(Command::Controls(controls.clone()))
                .map_err(|_| CameraError::ControlFailed("libcamera worker exited".into()))?;
            // frames already delivered were exposed with the old controls
            worker.frames.clear();
        }
        Ok(())
    }

    fn capture_raw(&mut self) -> Result<BayerFrame, CameraError> {
        let worker = self.worker.as_ref().ok_or(CameraError::NotStreaming)?;
        worker
            .frames
            .take()
            .ok_or_else(|| CameraError::CaptureFailed("libcamera worker exited".into()))?
    }

    fn close(&mut self) -> Result<(), CameraError> {
        let stopped = self.stop();
        if let Some(path) = self.tuning_file.take() {
            let _ = std::fs::remove_file(path);
        }
        stopped
    }
}

struct WorkerSetup {
    camera_index: usize,
    mode: SensorMode,
    pattern: CfaPattern,
    buffer_count: u32,
}

fn control_err(e: impl std::fmt::Debug) -> CameraError {
    CameraError::ControlFailed(format!("{e:?}"))
}

fn fill_request(controls: &mut ControlList, c: &SensorControls) -> Result<(), CameraError> {
    let (min_d, max_d) = c.frame_duration_limits;
    controls.set(AeEnable(c.ae_enable)).map_err(control_err)?;
    controls.set(AwbEnable(c.awb_enable)).map_err(control_err)?;
    controls
        .set(FrameDurationLimits([
            min_d.as_micros() as i64,
            max_d.as_micros() as i64,
        ]))
        .map_err(control_err)?;
    controls
        .set(ExposureTime(c.exposure_time.as_micros().min(i32::MAX as u128) as i32))
        .map_err(control_err)?;
    controls.set(AnalogueGain(c.analogue_gain)).map_err(control_err)?;
    controls.set(Contrast(c.contrast)).map_err(control_err)?;
    controls.set(Brightness(c.brightness)).map_err(control_err)?;
    let nr = if c.noise_reduction {
        NoiseReductionMode::Fast
    } else {
        NoiseReductionMode::Off
    };
    controls.set(nr).map_err(control_err)?;
    Ok(())
}

fn worker(setup: WorkerSetup, commands: Receiver<Command>, frames: Latest<FrameResult>) {
    if let Err(e) = run_worker(&setup, &commands, &frames) {
        tracing::warn!(error = %e, "libcamera worker failed");
        frames.publish(Err(e));
    }
    frames.close();
}

fn io_err(what: &str, e: impl std::fmt::Debug) -> CameraError {
    CameraError::CaptureFailed(format!("{what}: {e:?}"))
}

fn run_worker(
    setup: &WorkerSetup,
    commands: &Receiver<Command>,
    frames: &Latest<FrameResult>,
) -> Result<(), CameraError> {
    let mode = &setup.mode;

    let mgr = CameraManager::new().map_err(|e| io_err("camera manager", e))?;
    let cameras = mgr.cameras();
    let cam = cameras
        .get(setup.camera_index)
        .ok_or_else(|| CameraError::DeviceNotFound(format!("camera {}", setup.camera_index)))?;
    let mut active = cam.acquire().map_err(|_| CameraError::DeviceBusy)?;

    let mut cfgs = cam
        .generate_configuration(&[StreamRole::Raw])
        .ok_or_else(|| CameraError::FormatNegotiationFailed("no raw configuration".into()))?;
    {
        let mut cfg = cfgs
            .get_mut(0)
            .ok_or_else(|| CameraError::FormatNegotiationFailed("no raw stream".into()))?;
        let fourcc = if mode.bit_depth == 10 { *b"RG10" } else { *b"RG12" };
        cfg.set_pixel_format(PixelFormat::new(u32::from_le_bytes(fourcc), 0));
        cfg.set_size(Size {
            width: mode.width,
            height: mode.height,
        });
        cfg.set_buffer_count(setup.buffer_count);
    }
    match cfgs.validate() {
        CameraConfigurationStatus::Valid => {}
        CameraConfigurationStatus::Adjusted => {
            tracing::debug!(config = ?cfgs, "camera configuration adjusted");
        }
        CameraConfigurationStatus::Invalid => {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "configuration rejected: {cfgs:?}"
            )));
        }
    }
    active
        .configure(&mut cfgs)
        .map_err(|e| io_err("configure", e))?;

    let cfg = cfgs
        .get(0)
        .ok_or_else(|| CameraError::FormatNegotiationFailed("no raw stream".into()))?;
    let stride = cfg.get_stride() as usize;
    let size = cfg.get_size();
    let stream = cfg
        .stream()
        .ok_or_else(|| CameraError::CaptureFailed("stream not configured".into()))?;

    let (req_tx, req_rx) = mpsc::channel();
    active.on_request_completed(move |req| {
        let _ = req_tx.send(req);
    });

    let mut alloc = FrameBufferAllocator::new(&cam);
    let buffers = alloc
        .alloc(&stream)
        .map_err(|e| io_err("allocate buffers", e))?
        .into_iter()
        .map(|buf| MemoryMappedFrameBuffer::new(buf).map_err(|e| io_err("map buffer", e)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut controls: Option<SensorControls> = None;
    while let Ok(Command::Controls(c)) = commands.try_recv() {
        controls = Some(c);
    }

    let mut reqs = Vec::with_capacity(buffers.len());
    for buf in buffers {
        let mut req = active
            .create_request(None)
            .ok_or_else(|| CameraError::CaptureFailed("failed to create request".into()))?;
        req.add_buffer(&stream, buf)
            .map_err(|e| io_err("add buffer", e))?;
        if let Some(c) = &controls {
            fill_request(req.controls_mut(), c)?;
        }
        reqs.push(req);
    }

    active.start(None).map_err(|e| io_err("start", e))?;
    for req in reqs {
        active.queue_request(req).map_err(|e| io_err("queue request", e))?;
    }
    tracing::debug!(width = size.width, height = size.height, stride, "libcamera streaming");

    let mut sequence = 0u32;
    let timeout = controls
        .as_ref()
        .map(|c| c.exposure_time)
        .unwrap_or_default()
        + Duration::from_secs(5);

    let result = loop {
        match commands.try_recv() {
            Ok(Command::Controls(c)) => controls = Some(c),
            Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => break Ok(()),
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let mut req = match req_rx.recv_timeout(timeout) {
            Ok(req) => req,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("camera request timeout");
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Err(CameraError::CaptureFailed("request channel closed".into()));
            }
        };

        let framebuffer: Option<&MemoryMappedFrameBuffer<FrameBuffer>> = req.buffer(&stream);
        let frame = match framebuffer.and_then(|fb| fb.data().first().copied()) {
            Some(plane) => BayerFrame::from_le_bytes(
                plane,
                size.width,
                size.height,
                stride,
                setup.pattern,
                mode.bit_depth,
            )
            .map_err(CameraError::from),
            None => Err(CameraError::CaptureFailed("request without buffer".into())),
        };
        let frame = frame.map(|mut f| {
            sequence = sequence.wrapping_add(1);
            f.sequence = sequence;
            f
        });

        if !frames.publish(frame) {
            break Ok(());
        }

        req.reuse(ReuseFlag::REUSE_BUFFERS);
        if let Some(c) = &controls {
            fill_request(req.controls_mut(), c)?;
        }
        if let Err(e) = active.queue_request(req) {
            break Err(io_err("re-queue request", e));
        }
    };

    if let Err(e) = active.stop() {
        tracing::warn!(error = %e, "error stopping capture");
    }
    while req_rx.try_recv().is_ok() {}
    result
}
