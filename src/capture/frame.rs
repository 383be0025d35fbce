//! Frame decoding and persistence

use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::CaptureConfig;
use crate::core::error::{CaptureError, Result};
use crate::core::types::Tick;
use crate::engine::RawImage;

/// A decoded image tagged with the steady-state tick it belongs to
#[derive(Debug, Clone)]
pub struct Frame {
    pub tick: Tick,
    pub image: RgbImage,
}

/// Convert a raw B-G-R-A image into an R-G-B buffer
pub fn decode(raw: &RawImage) -> Result<RgbImage> {
    let expected = RawImage::byte_len(raw.width, raw.height);
    if raw.data.len() != expected {
        return Err(CaptureError::FrameFormat {
            expected,
            actual: raw.data.len(),
        });
    }

    let rgb: Vec<u8> = raw
        .data
        .chunks_exact(RawImage::CHANNELS)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();

    RgbImage::from_raw(raw.width, raw.height, rgb).ok_or(CaptureError::FrameFormat {
        expected,
        actual: raw.data.len(),
    })
}

/// Writes frames as `<prefix>-<tick:04>.<extension>` into one directory
#[derive(Debug, Clone)]
pub struct FrameWriter {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl FrameWriter {
    /// Creates the output directory if it does not exist
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            extension: extension.into(),
        })
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        Self::new(&config.output_dir, &config.file_prefix, &config.extension)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tick: Tick) -> PathBuf {
        self.dir.join(format!("{}-{:04}.{}", self.prefix, tick, self.extension))
    }

    pub fn write(&self, frame: &Frame) -> Result<PathBuf> {
        let path = self.path_for(frame.tick);
        frame.image.save(&path)?;
        Ok(path)
    }
}
