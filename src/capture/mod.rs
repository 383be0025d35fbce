//! Camera capture
//!
//! Attach an RGB camera to one actor, let it settle, then advance the
//! simulation one tick at a time and persist exactly one frame per tick.

pub mod frame;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::core::config::CameraConfig;
use crate::core::error::{CaptureError, Result};
use crate::core::types::{ActorId, Tick, Transform};
use crate::engine::{Blueprint, BlueprintLibrary, Engine};
use crate::population::{VehicleRegistry, WalkerRegistry};

pub use frame::{decode, Frame, FrameWriter};
pub use queue::FrameQueue;

/// Camera blueprint plus where it is mounted on its parent
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSpec {
    pub blueprint: String,
    pub width: u32,
    pub height: u32,
    pub fov: f32,
    pub mount: Transform,
}

impl From<&CameraConfig> for CameraSpec {
    fn from(config: &CameraConfig) -> Self {
        Self {
            blueprint: config.blueprint.clone(),
            width: config.width,
            height: config.height,
            fov: config.fov,
            mount: config.mount(),
        }
    }
}

impl CameraSpec {
    pub fn to_blueprint(&self, library: &BlueprintLibrary) -> Result<Blueprint> {
        let mut blueprint = library.find(&self.blueprint)?;
        blueprint.set_attribute("image_size_x", self.width.to_string());
        blueprint.set_attribute("image_size_y", self.height.to_string());
        blueprint.set_attribute("fov", self.fov.to_string());
        Ok(blueprint)
    }
}

/// Spawn the camera attached to `parent`
pub fn attach_camera(
    engine: &dyn Engine,
    library: &BlueprintLibrary,
    spec: &CameraSpec,
    parent: ActorId,
) -> Result<ActorId> {
    let blueprint = spec.to_blueprint(library)?;
    let camera = engine.spawn_actor(&blueprint, &spec.mount, Some(parent))?;
    tracing::info!(%camera, %parent, "camera attached");
    Ok(camera)
}

/// Pick the actor the camera follows
///
/// Prefers the walker at `walker_index`; falls back to the last walker, then
/// to the first vehicle.
pub fn select_camera_target(
    vehicles: &VehicleRegistry,
    walkers: &WalkerRegistry,
    walker_index: usize,
) -> Result<ActorId> {
    if let Some(body) = walkers.body(walker_index) {
        return Ok(body);
    }

    let fallback = walkers
        .records()
        .last()
        .map(|r| r.body)
        .or_else(|| vehicles.ids().first().copied())
        .ok_or(CaptureError::NoCameraTarget)?;
    tracing::warn!(
        requested = walker_index,
        walkers = walkers.len(),
        target = %fallback,
        "camera target walker missing, using fallback actor"
    );
    Ok(fallback)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames thrown away after warm-up or as stale
    pub discarded: usize,
    pub frames_written: u64,
}

/// Warm-up and steady-state capture
pub struct CaptureLoop<'a> {
    engine: &'a dyn Engine,
    queue: &'a FrameQueue,
    writer: &'a FrameWriter,
    frame_timeout: Duration,
    cancel: &'a AtomicBool,
}

impl<'a> CaptureLoop<'a> {
    pub fn new(
        engine: &'a dyn Engine,
        queue: &'a FrameQueue,
        writer: &'a FrameWriter,
        frame_timeout: Duration,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            engine,
            queue,
            writer,
            frame_timeout,
            cancel,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CaptureError::Interrupted);
        }
        Ok(())
    }

    /// Advance `ticks` ticks and drop every frame they produced
    pub fn warm_up(&self, ticks: u64) -> Result<usize> {
        for _ in 0..ticks {
            self.check_cancel()?;
            self.engine.wait_for_tick()?;
        }
        let discarded = self.queue.clear();
        tracing::info!(ticks, discarded, "camera warm-up complete");
        Ok(discarded)
    }

    /// Wait for the frame rendered at or after `engine_tick`
    ///
    /// Frames from earlier ticks can still be in flight after a warm-up
    /// clear; they are dropped so the persisted frame matches its tick.
    fn next_frame(&self, tick: Tick, engine_tick: Tick, stats: &mut CaptureStats) -> Result<Frame> {
        let deadline = Instant::now() + self.frame_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let raw = self
                .queue
                .pop(remaining)?
                .ok_or(CaptureError::FrameTimeout {
                    tick,
                    waited: self.frame_timeout,
                })?;
            if raw.frame < engine_tick {
                stats.discarded += 1;
                tracing::debug!(frame = raw.frame, engine_tick, "dropping stale frame");
                continue;
            }
            return Ok(Frame {
                tick,
                image: decode(&raw)?,
            });
        }
    }

    /// Advance one tick, then persist exactly one frame, `ticks` times
    pub fn run(&self, ticks: u64) -> Result<CaptureStats> {
        let mut stats = CaptureStats::default();
        for tick in 0..ticks {
            self.check_cancel()?;
            let engine_tick = self.engine.wait_for_tick()?;
            let frame = self.next_frame(tick, engine_tick, &mut stats)?;
            self.writer.write(&frame)?;
            stats.frames_written += 1;

            if (tick + 1) % 100 == 0 {
                tracing::debug!(written = stats.frames_written, "capture progress");
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchResult;
    use crate::engine::sandbox::default_library;

    #[test]
    fn test_camera_blueprint_attributes() {
        let spec = CameraSpec::from(&CameraConfig::default());
        let bp = spec.to_blueprint(&default_library()).unwrap();
        assert_eq!(bp.attribute("image_size_x").unwrap().value, "800");
        assert_eq!(bp.attribute("image_size_y").unwrap().value, "600");
        assert_eq!(bp.attribute("fov").unwrap().value, "100");
    }

    #[test]
    fn test_target_prefers_indexed_walker() {
        let mut walkers = WalkerRegistry::new();
        walkers.ingest_bodies(&[BatchResult::Ok(ActorId(5)), BatchResult::Ok(ActorId(6))]);
        let vehicles = VehicleRegistry::new();

        assert_eq!(select_camera_target(&vehicles, &walkers, 1).unwrap(), ActorId(6));
        assert_eq!(select_camera_target(&vehicles, &walkers, 19).unwrap(), ActorId(6));
    }

    #[test]
    fn test_target_falls_back_to_vehicle() {
        let mut vehicles = VehicleRegistry::new();
        vehicles.ingest(&[BatchResult::Ok(ActorId(1))]);
        let walkers = WalkerRegistry::new();

        assert_eq!(select_camera_target(&vehicles, &walkers, 19).unwrap(), ActorId(1));
    }

    #[test]
    fn test_no_target_is_error() {
        let result = select_camera_target(&VehicleRegistry::new(), &WalkerRegistry::new(), 0);
        assert!(matches!(result, Err(CaptureError::NoCameraTarget)));
    }
}
