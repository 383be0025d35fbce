use std::time::Duration;

use thiserror::Error;

use crate::core::types::{ActorId, Tick};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Blueprint not found: {0}")]
    BlueprintNotFound(String),

    #[error("No blueprints match filter '{0}'")]
    NoBlueprints(String),

    #[error("Batch returned {actual} results for {expected} commands")]
    BatchMismatch { expected: usize, actual: usize },

    #[error("Actor not found: {0}")]
    ActorNotFound(ActorId),

    #[error("No actor available to attach the camera to")]
    NoCameraTarget,

    #[error("No frame arrived for tick {tick} within {waited:?}")]
    FrameTimeout { tick: Tick, waited: Duration },

    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    FrameFormat { expected: usize, actual: usize },

    #[error("Sensor stream disconnected")]
    SensorDisconnected,

    #[error("Interrupted")]
    Interrupted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
