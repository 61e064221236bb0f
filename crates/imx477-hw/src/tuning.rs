//! Camera tuning profiles.
//!
//! The Raspberry Pi IPA reads its per-sensor algorithm parameters from a JSON
//! file. Profiles are loaded by name or path, patched in memory, and written
//! back out so the camera stack can pick the patched copy up through
//! `LIBCAMERA_RPI_TUNING_FILE`.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable the Raspberry Pi IPA reads the tuning file path from.
pub const TUNING_FILE_ENV: &str = "LIBCAMERA_RPI_TUNING_FILE";

/// Directories searched for tuning files given by bare name.
pub const TUNING_DIRS: &[&str] = &[
    "/usr/share/libcamera/ipa/rpi/vc4",
    "/usr/share/libcamera/ipa/rpi/pisp",
    "/usr/local/share/libcamera/ipa/rpi/vc4",
    "/usr/local/share/libcamera/ipa/rpi/pisp",
    "/usr/share/libcamera/ipa/raspberrypi",
    "/usr/local/share/libcamera/ipa/raspberrypi",
];

/// Tuning file tuned for linear, unprocessed output.
pub const DEFAULT_TUNING: &str = "imx477_scientific.json";

const CONTRAST_ALGO: &str = "rpi.contrast";
const LINEAR_GAMMA: [u32; 4] = [0, 0, 65535, 65535];

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("tuning file not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid tuning JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("tuning algorithm not found: {0}")]
    AlgorithmNotFound(String),
    #[error("tuning algorithm {0} is not an object")]
    InvalidAlgorithm(String),
}

/// A parsed tuning file.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    path: PathBuf,
    json: Value,
}

impl TuningProfile {
    /// Load a tuning file by path, or by bare name from the standard
    /// tuning directories.
    pub fn load(name: impl AsRef<Path>) -> Result<Self, TuningError> {
        Self::load_from(name, TUNING_DIRS)
    }

    /// Like [`load`](Self::load) with an explicit search list.
    pub fn load_from<D: AsRef<Path>>(
        name: impl AsRef<Path>,
        dirs: &[D],
    ) -> Result<Self, TuningError> {
        let path = resolve(name.as_ref(), dirs)?;
        let text = std::fs::read_to_string(&path).map_err(|source| TuningError::Read {
            path: path.clone(),
            source,
        })?;
        let json = serde_json::from_str(&text).map_err(|source| TuningError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded tuning file");
        Ok(Self { path, json })
    }

    pub fn from_json(json: Value, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    /// File the profile was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_json(&self) -> &Value {
        &self.json
    }

    /// Tuning file format version; files without one are version 1.
    pub fn version(&self) -> f64 {
        self.json
            .get("version")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
    }

    /// Parameters of the named algorithm.
    ///
    /// Version 2 files keep algorithms in an `algorithms` array of
    /// single-key objects; version 1 files use top-level keys.
    pub fn find_algo(&self, name: &str) -> Option<&Value> {
        if self.version() >= 2.0 {
            self.json
                .get("algorithms")?
                .as_array()?
                .iter()
                .find_map(|entry| entry.get(name))
        } else {
            self.json.get(name)
        }
    }

    pub fn find_algo_mut(&mut self, name: &str) -> Option<&mut Value> {
        if self.version() >= 2.0 {
            self.json
                .get_mut("algorithms")?
                .as_array_mut()?
                .iter_mut()
                .find_map(|entry| entry.get_mut(name))
        } else {
            self.json.get_mut(name)
        }
    }

    /// Switch off contrast enhancement and make the gamma curve the identity.
    /// Returns the gamma curve that was replaced, if there was one.
    pub fn linearize_contrast(&mut self) -> Result<Option<Value>, TuningError> {
        let algo = self
            .find_algo_mut(CONTRAST_ALGO)
            .ok_or_else(|| TuningError::AlgorithmNotFound(CONTRAST_ALGO.to_string()))?;
        let params = algo
            .as_object_mut()
            .ok_or_else(|| TuningError::InvalidAlgorithm(CONTRAST_ALGO.to_string()))?;

        let previous = params.insert("gamma_curve".to_string(), json!(LINEAR_GAMMA));
        params.insert("ce_enable".to_string(), json!(0));
        tracing::debug!("contrast enhancement disabled, gamma linearised");
        Ok(previous)
    }

    /// Write the profile as pretty-printed JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), TuningError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&self.json).map_err(|source| {
            TuningError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, text).map_err(|source| TuningError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the profile to a per-process file under the temp directory and
    /// return its path.
    pub fn persist(&self) -> Result<PathBuf, TuningError> {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("tuning");
        let path = std::env::temp_dir().join(format!("{stem}-{}.json", std::process::id()));
        self.write(&path)?;
        Ok(path)
    }
}

fn resolve<D: AsRef<Path>>(name: &Path, dirs: &[D]) -> Result<PathBuf, TuningError> {
    if name.exists() {
        return Ok(name.to_path_buf());
    }
    if name.is_absolute() {
        return Err(TuningError::NotFound(name.display().to_string()));
    }
    dirs.iter()
        .map(|d| d.as_ref().join(name))
        .find(|p| p.exists())
        .ok_or_else(|| TuningError::NotFound(name.display().to_string()))
}
