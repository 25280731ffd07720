//! Engine configuration, loaded from `ROLLCALL_*` environment variables
//! with defaults, or from a TOML file. [`ConfigHandle`] makes the live
//! values hot-swappable: workers take a snapshot per operation, so
//! directory or threshold changes apply without a restart.

use rollcall_core::{DetectorConfig, LbphParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the global enrollment dataset: `faces/{studentId}/*.jpg`.
    pub faces_dir: PathBuf,
    /// Where the global model artifact pair is persisted.
    pub model_dir: PathBuf,
    /// Per-section local model directories live under here.
    pub sections_dir: PathBuf,

    /// Primary/fallback cascade model files; either may be absent.
    pub primary_cascade: Option<PathBuf>,
    pub fallback_cascade: Option<PathBuf>,

    pub min_face_size: u32,
    pub scale_factor: f32,
    pub min_neighbors: u32,
    /// Detection-time frame scale (1.0 = off, < 1.0 shrinks).
    pub detect_downscale: f32,

    /// Canonical face size for training and recognition.
    pub target_width: u32,
    pub target_height: u32,
    /// Laplacian-variance floor for training images (0 = gate off).
    pub blur_threshold: f64,

    pub models_bucket: String,
    pub datasets_bucket: String,

    /// Dataset-refresh metadata poll cadence and budget.
    pub refresh_poll_interval_ms: u64,
    pub refresh_poll_total_ms: u64,
    pub download_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            faces_dir: PathBuf::from("data/faces"),
            model_dir: PathBuf::from("data/model"),
            sections_dir: PathBuf::from("data/sections"),
            primary_cascade: None,
            fallback_cascade: None,
            min_face_size: 40,
            scale_factor: 1.1,
            min_neighbors: 5,
            detect_downscale: 1.0,
            target_width: 100,
            target_height: 100,
            blur_threshold: 0.0,
            models_bucket: "class-models".to_string(),
            datasets_bucket: "class-datasets".to_string(),
            refresh_poll_interval_ms: 2_000,
            refresh_poll_total_ms: 6_000,
            download_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Load from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            faces_dir: env_path("ROLLCALL_FACES_DIR", d.faces_dir),
            model_dir: env_path("ROLLCALL_MODEL_DIR", d.model_dir),
            sections_dir: env_path("ROLLCALL_SECTIONS_DIR", d.sections_dir),
            primary_cascade: std::env::var("ROLLCALL_PRIMARY_CASCADE")
                .ok()
                .map(PathBuf::from),
            fallback_cascade: std::env::var("ROLLCALL_FALLBACK_CASCADE")
                .ok()
                .map(PathBuf::from),
            min_face_size: env_parse("ROLLCALL_MIN_FACE_SIZE", d.min_face_size),
            scale_factor: env_parse("ROLLCALL_SCALE_FACTOR", d.scale_factor),
            min_neighbors: env_parse("ROLLCALL_MIN_NEIGHBORS", d.min_neighbors),
            detect_downscale: env_parse("ROLLCALL_DETECT_DOWNSCALE", d.detect_downscale),
            target_width: env_parse("ROLLCALL_TARGET_WIDTH", d.target_width),
            target_height: env_parse("ROLLCALL_TARGET_HEIGHT", d.target_height),
            blur_threshold: env_parse("ROLLCALL_BLUR_THRESHOLD", d.blur_threshold),
            models_bucket: std::env::var("ROLLCALL_MODELS_BUCKET").unwrap_or(d.models_bucket),
            datasets_bucket: std::env::var("ROLLCALL_DATASETS_BUCKET")
                .unwrap_or(d.datasets_bucket),
            refresh_poll_interval_ms: env_parse(
                "ROLLCALL_REFRESH_POLL_INTERVAL_MS",
                d.refresh_poll_interval_ms,
            ),
            refresh_poll_total_ms: env_parse(
                "ROLLCALL_REFRESH_POLL_TOTAL_MS",
                d.refresh_poll_total_ms,
            ),
            download_timeout_secs: env_parse(
                "ROLLCALL_DOWNLOAD_TIMEOUT_SECS",
                d.download_timeout_secs,
            ),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            min_face_size: self.min_face_size,
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            downscale: self.detect_downscale,
        }
    }

    pub fn lbph_params(&self) -> LbphParams {
        LbphParams {
            target_width: self.target_width,
            target_height: self.target_height,
            blur_threshold: self.blur_threshold,
            ..LbphParams::default()
        }
    }

    pub fn refresh_poll_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_poll_interval_ms)
    }

    pub fn refresh_poll_total(&self) -> Duration {
        Duration::from_millis(self.refresh_poll_total_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Shared, hot-reloadable view of the engine configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<EngineConfig>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Owned copy of the current values.
    pub fn snapshot(&self) -> EngineConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the live configuration; takes effect on the next operation.
    pub fn apply(&self, config: EngineConfig) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = config;
        tracing::info!("engine configuration replaced");
    }

    /// Adjust the live configuration in place.
    pub fn update(&self, f: impl FnOnce(&mut EngineConfig)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
        tracing::info!("engine configuration updated");
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let c = EngineConfig::default();
        assert_eq!(c.refresh_poll_total_ms, 6_000);
        assert_eq!(c.refresh_poll_interval_ms, 2_000);
        assert!(c.detector_config().scale_factor > 1.0);
        assert_eq!(c.lbph_params().target_width, 100);
    }

    #[test]
    fn test_handle_snapshot_and_update() {
        let handle = ConfigHandle::default();
        handle.update(|c| c.blur_threshold = 42.0);
        assert_eq!(handle.snapshot().blur_threshold, 42.0);

        let mut replacement = EngineConfig::default();
        replacement.faces_dir = PathBuf::from("/elsewhere/faces");
        handle.apply(replacement);
        assert_eq!(handle.snapshot().faces_dir, PathBuf::from("/elsewhere/faces"));
    }

    #[test]
    fn test_toml_parse_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "faces_dir = \"/srv/faces\"\nblur_threshold = 55.5\n",
        )
        .unwrap();

        let c = EngineConfig::from_file(&path).unwrap();
        assert_eq!(c.faces_dir, PathBuf::from("/srv/faces"));
        assert_eq!(c.blur_threshold, 55.5);
        // Unspecified fields keep defaults.
        assert_eq!(c.models_bucket, "class-models");
    }
}
