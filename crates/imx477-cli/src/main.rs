mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::Config;
use imx477_hw::{
    modes, Camera, CaptureOptions, MonobinMode, SensorBackend, SessionConfig, TuningProfile,
    V4l2Backend,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "imx477", about = "IMX477 raw capture and Bayer processing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the sensor readout modes
    Modes,
    /// List V4L2 capture devices
    Devices,
    /// Show a tuning profile, optionally linearising its contrast curve
    Tuning {
        /// Tuning file name or path (default: IMX477_TUNING_FILE)
        name: Option<String>,
        /// Disable contrast enhancement and use an identity gamma curve
        #[arg(long)]
        linearize: bool,
        /// Write the resulting profile here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Capture frames and write them as 16-bit PNGs
    Capture(CaptureArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    V4l2,
    Libcamera,
}

#[derive(Args)]
struct CaptureArgs {
    #[arg(long, value_enum, default_value_t = BackendKind::V4l2)]
    backend: BackendKind,
    /// Capture options file (TOML, or JSON by extension); flags override it
    #[arg(long)]
    options: Option<PathBuf>,
    /// Sensor mode index (default: IMX477_SENSOR_MODE)
    #[arg(long)]
    mode: Option<usize>,
    /// Exposure time in microseconds
    #[arg(short, long)]
    exposure: Option<u64>,
    /// Analogue gain (monobin only)
    #[arg(short, long)]
    gain: Option<f32>,
    /// Use the recording crop starting at this row
    #[arg(long)]
    crop_y: Option<u32>,
    #[arg(long)]
    preview_crop_y: Option<u32>,
    #[arg(long)]
    preview_crop_height: Option<u32>,
    /// Produce binned 16-bit mono output
    #[arg(long)]
    monobin: bool,
    /// rgb, red, green, blue (or 0-3)
    #[arg(long)]
    monobin_mode: Option<MonobinMode>,
    /// Bin single-layer monobin output as well
    #[arg(long)]
    bin: bool,
    /// Number of frames to capture
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,
    /// Leave the max ADU statistics untouched
    #[arg(long)]
    recording: bool,
    /// Output directory (default: IMX477_OUTPUT_DIR)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

impl CaptureArgs {
    fn capture_options(&self) -> Result<CaptureOptions> {
        let mut opts = match &self.options {
            Some(path) => config::load_options(path)?,
            None => CaptureOptions::default(),
        };
        if let Some(e) = self.exposure {
            opts.exposure_time = e;
        }
        if let Some(g) = self.gain {
            opts.gain = g;
        }
        if let Some(y) = self.crop_y {
            opts.crop = true;
            opts.crop_y = y;
        }
        if let Some(y) = self.preview_crop_y {
            opts.preview_crop_y = y;
        }
        if let Some(h) = self.preview_crop_height {
            opts.preview_crop_height = h;
        }
        if let Some(m) = self.monobin_mode {
            opts.monobin_mode = m;
        }
        opts.monobin |= self.monobin;
        opts.bin |= self.bin;
        Ok(opts)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Modes => {
            let info = modes::sensor_info()?;
            println!(
                "{} ({:?}, {} MHz pixel rate)",
                info.model,
                info.pattern,
                info.pixel_rate / 1_000_000
            );
            for m in modes::sensor_modes() {
                println!(
                    "  [{}] {}x{} {}-bit {} crop={:?} max {:.2} fps{}",
                    m.index,
                    m.width,
                    m.height,
                    m.bit_depth,
                    m.format,
                    m.crop,
                    m.max_fps,
                    if m.index == modes::DEFAULT_MODE { " (default)" } else { "" }
                );
            }
        }
        Commands::Devices => {
            let devices = V4l2Backend::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}: {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Tuning {
            name,
            linearize,
            output,
        } => {
            let name = name.unwrap_or_else(|| config.tuning_file.clone());
            let mut profile = TuningProfile::load(&name)?;
            eprintln!(
                "{} (version {})",
                profile.path().display(),
                profile.version()
            );
            if linearize {
                if let Some(previous) = profile.linearize_contrast()? {
                    eprintln!("replaced gamma curve: {previous}");
                }
            }
            match output {
                Some(path) => {
                    profile.write(&path)?;
                    eprintln!("wrote {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(profile.as_json())?),
            }
        }
        Commands::Capture(args) => capture(&config, &args)?,
    }

    Ok(())
}

fn open_backend(kind: BackendKind, config: &Config) -> Result<Box<dyn SensorBackend>> {
    match kind {
        BackendKind::V4l2 => Ok(Box::new(V4l2Backend::open(
            &config.video_device,
            config.subdev.as_deref(),
        )?)),
        BackendKind::Libcamera => open_libcamera(config),
    }
}

#[cfg(feature = "libcamera")]
fn open_libcamera(config: &Config) -> Result<Box<dyn SensorBackend>> {
    let mut profile = TuningProfile::load(&config.tuning_file)?;
    if let Err(e) = profile.linearize_contrast() {
        tracing::warn!(error = %e, "tuning profile left unpatched");
    }
    Ok(Box::new(imx477_hw::libcamera::LibcameraBackend::open(
        config.camera_index,
        Some(&profile),
    )?))
}

#[cfg(not(feature = "libcamera"))]
fn open_libcamera(_config: &Config) -> Result<Box<dyn SensorBackend>> {
    bail!("built without libcamera support (enable the `libcamera` feature)")
}

fn capture(config: &Config, args: &CaptureArgs) -> Result<()> {
    if args.count == 0 {
        bail!("--count must be at least 1");
    }
    let options = args.capture_options()?;
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.output_dir.clone());
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let session = SessionConfig {
        sensor_mode: args.mode.unwrap_or(config.sensor_mode),
        buffer_count: config.buffer_count,
        ..Default::default()
    };
    let mut camera: Camera<Box<dyn SensorBackend>> = Camera::new(session);
    let (width, height) = camera.init(open_backend(args.backend, config)?)?;
    println!("{} streaming {width}x{height}", camera.name());

    camera.update_controls(&options)?;

    let kind = if options.monobin {
        format!("mono-{}", options.monobin_mode)
    } else {
        "preview".to_string()
    };
    for _ in 0..args.count {
        let Some(frame) = camera.capture(args.recording)? else {
            bail!("camera session closed");
        };
        let path = output_dir.join(format!("frame-{:05}-{kind}.png", frame.sequence));
        frame
            .image
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!(
            "{} {}x{} max_adu={}",
            path.display(),
            frame.width(),
            frame.height(),
            serde_json::to_string(&camera.max_adu())?
        );
    }

    camera.stop()?;
    Ok(())
}
