//! Run configuration with documented defaults
//!
//! Every knob of a population/capture run lives here. Values come from the
//! defaults below, optionally overridden by a TOML file and then by the CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{CaptureError, Result};
use crate::core::types::{Location, Rotation, Transform};

/// Output files are numbered with four digits
pub const MAX_CAPTURE_TICKS: u64 = 10_000;

/// Top-level configuration for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub server: ServerConfig,
    pub vehicles: VehicleConfig,
    pub walkers: WalkerConfig,
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    /// Seed for every random choice; a fresh one is drawn when absent
    pub seed: Option<u64>,
}

/// Where the simulator bridge lives and which map to load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout in seconds
    pub timeout_secs: f64,
    /// World map loaded before populating
    pub map: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 2000,
            timeout_secs: 2.0,
            map: "Town01".into(),
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Result<Duration> {
        seconds("server.timeout_secs", self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Requested vehicle count (clamped to the number of spawn points)
    pub count: usize,
    /// Wildcard pattern matched against blueprint ids and tags
    pub filter: String,
    /// Drop blueprints prone to accidents (non 4-wheel, isetta, carlacola)
    pub safe: bool,
    /// Enroll spawned vehicles in the engine's crowd movement control
    pub crowd_control: bool,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            count: 100,
            filter: "vehicle.*".into(),
            safe: false,
            crowd_control: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    pub count: usize,
    pub filter: String,
    pub controller_blueprint: String,
    /// Navigation samples allowed per requested walker before giving up
    ///
    /// Misses are retried, so the budget bounds the loop when the navigation
    /// mesh is sparse or missing.
    pub location_attempts_per_walker: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            count: 200,
            filter: "walker.pedestrian.*".into(),
            controller_blueprint: "controller.ai.walker".into(),
            location_attempts_per_walker: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub blueprint: String,
    pub width: u32,
    pub height: u32,
    /// Horizontal field of view in degrees
    pub fov: f32,
    /// Mount offset relative to the parent actor (behind and above)
    pub offset_x: f32,
    pub offset_z: f32,
    pub pitch: f32,
    /// Index into the walker registry of the actor the camera follows
    pub target_walker: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            blueprint: "sensor.camera.rgb".into(),
            width: 800,
            height: 600,
            fov: 100.0,
            offset_x: -3.5,
            offset_z: 1.4,
            pitch: -15.0,
            target_walker: 19,
        }
    }
}

impl CameraConfig {
    pub fn mount(&self) -> Transform {
        Transform::new(
            Location::new(self.offset_x, 0.0, self.offset_z),
            Rotation::new(self.pitch, 0.0, 0.0),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Ticks whose frames are discarded while the camera settles
    pub warmup_ticks: u64,
    /// Steady-state ticks, one persisted frame each
    pub ticks: u64,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    /// Image format is chosen from this extension
    pub extension: String,
    /// Longest wait for a single frame before the run is aborted
    pub frame_timeout_secs: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            warmup_ticks: 20,
            ticks: 2000,
            output_dir: PathBuf::from("tmp"),
            file_prefix: "test".into(),
            extension: "jpg".into(),
            frame_timeout_secs: 10.0,
        }
    }
}

impl CaptureConfig {
    pub fn frame_timeout(&self) -> Result<Duration> {
        seconds("capture.frame_timeout_secs", self.frame_timeout_secs)
    }
}

/// A strictly positive, finite number of seconds as a `Duration`
fn seconds(key: &str, value: f64) -> Result<Duration> {
    if !(value.is_finite() && value > 0.0) {
        return Err(CaptureError::Config(format!(
            "{} ({}) must be a positive number of seconds",
            key, value
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| CaptureError::Config(format!("{} ({}): {}", key, value, e)))
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration for internal consistency
    pub fn validate(&self) -> Result<()> {
        self.server.timeout()?;

        if self.vehicles.filter.is_empty() || self.walkers.filter.is_empty() {
            return Err(CaptureError::Config("blueprint filters must not be empty".into()));
        }

        if self.walkers.location_attempts_per_walker == 0 {
            return Err(CaptureError::Config(
                "walkers.location_attempts_per_walker must be at least 1".into(),
            ));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(CaptureError::Config(format!(
                "camera resolution {}x{} is empty",
                self.camera.width, self.camera.height
            )));
        }

        if !(self.camera.fov > 0.0 && self.camera.fov < 180.0) {
            return Err(CaptureError::Config(format!(
                "camera.fov ({}) must be within (0, 180)",
                self.camera.fov
            )));
        }

        if self.capture.ticks > MAX_CAPTURE_TICKS {
            return Err(CaptureError::Config(format!(
                "capture.ticks ({}) exceeds {}",
                self.capture.ticks, MAX_CAPTURE_TICKS
            )));
        }

        self.capture.frame_timeout()?;

        Ok(())
    }
}
