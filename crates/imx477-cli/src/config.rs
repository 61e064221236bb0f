use anyhow::{Context, Result};
use imx477_hw::modes::DEFAULT_MODE;
use imx477_hw::tuning::DEFAULT_TUNING;
use imx477_hw::CaptureOptions;
use std::path::{Path, PathBuf};

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 capture node (default: /dev/video0).
    pub video_device: String,
    /// Sensor sub-device carrying exposure/gain controls. Discovered
    /// through sysfs when unset.
    pub subdev: Option<String>,
    /// Tuning file name or path handed to libcamera.
    pub tuning_file: String,
    /// libcamera camera index.
    pub camera_index: usize,
    /// Index into the sensor mode table.
    pub sensor_mode: usize,
    pub buffer_count: u32,
    /// Where captured frames are written.
    pub output_dir: PathBuf,
}

impl Config {
    /// Load configuration from `IMX477_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            video_device: std::env::var("IMX477_VIDEO_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            subdev: std::env::var("IMX477_SUBDEV").ok().filter(|s| !s.is_empty()),
            tuning_file: std::env::var("IMX477_TUNING_FILE")
                .unwrap_or_else(|_| DEFAULT_TUNING.to_string()),
            camera_index: env_parse("IMX477_CAMERA_INDEX", 0),
            sensor_mode: env_parse("IMX477_SENSOR_MODE", DEFAULT_MODE),
            buffer_count: env_parse("IMX477_BUFFER_COUNT", 10),
            output_dir: std::env::var("IMX477_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read capture options from a `.json` or TOML file.
pub fn load_options(path: &Path) -> Result<CaptureOptions> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let options = if is_json {
        serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))?
    } else {
        toml::from_str(&text).with_context(|| format!("invalid TOML in {}", path.display()))?
    };
    Ok(options)
}
