//! One complete run: populate, capture, release
//!
//! The population lives in a [`PopulationGuard`] from the first spawn on, so
//! errors and interrupts in any later step still end in a teardown of
//! whatever had been created up to that point.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::capture::{self, CameraSpec, CaptureLoop, CaptureStats, FrameQueue, FrameWriter};
use crate::core::config::RunConfig;
use crate::core::error::{CaptureError, Result};
use crate::core::types::ActorId;
use crate::engine::{BlueprintLibrary, Engine};
use crate::population::{enable_crowd_control, spawn_vehicles, spawn_walkers};
use crate::teardown::{PopulationGuard, TeardownReport};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub seed: u64,
    pub vehicles: usize,
    pub walkers: usize,
    pub camera_target: Option<ActorId>,
    pub capture: CaptureStats,
    pub teardown: TeardownReport,
}

pub struct Session<'e> {
    engine: &'e dyn Engine,
    config: RunConfig,
    cancel: Arc<AtomicBool>,
}

impl<'e> Session<'e> {
    pub fn new(engine: &'e dyn Engine, config: RunConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            engine,
            config,
            cancel,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CaptureError::Interrupted);
        }
        Ok(())
    }

    /// Run every phase; teardown happens before this returns, success or not
    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;

        let seed = self.config.seed.unwrap_or_else(rand::random);
        tracing::info!(seed, map = %self.config.server.map, "starting run");
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        self.engine.load_world(&self.config.server.map)?;
        let library = self.engine.blueprint_library()?;

        let mut guard = PopulationGuard::new(self.engine);
        let outcome = self.populate_and_capture(&library, &mut rng, &mut guard);
        let teardown = guard.release();
        tracing::info!(?teardown, "population released");

        let mut summary = outcome?;
        summary.seed = seed;
        summary.teardown = teardown;
        Ok(summary)
    }

    fn populate_and_capture(
        &self,
        library: &BlueprintLibrary,
        rng: &mut ChaCha8Rng,
        guard: &mut PopulationGuard<'_>,
    ) -> Result<RunSummary> {
        let config = &self.config;
        let population = guard.population_mut();

        spawn_vehicles(self.engine, library, &config.vehicles, rng, &mut population.vehicles)?;
        self.check_cancel()?;

        spawn_walkers(self.engine, library, &config.walkers, rng, &mut population.walkers)?;
        self.check_cancel()?;

        if config.vehicles.crowd_control {
            enable_crowd_control(self.engine, &mut population.vehicles);
        }

        tracing::info!(
            "spawned {} vehicles and {} walkers",
            population.vehicles.len(),
            population.walkers.len()
        );

        let target = capture::select_camera_target(
            &population.vehicles,
            &population.walkers,
            config.camera.target_walker,
        )?;
        let spec = CameraSpec::from(&config.camera);
        let camera = capture::attach_camera(self.engine, library, &spec, target)?;
        population.camera = Some(camera);

        let queue = FrameQueue::new();
        self.engine.listen(camera, queue.callback())?;
        let writer = FrameWriter::from_config(&config.capture)?;

        let frame_timeout = config.capture.frame_timeout()?;
        let capture = CaptureLoop::new(self.engine, &queue, &writer, frame_timeout, &self.cancel);
        let discarded = capture.warm_up(config.capture.warmup_ticks)?;
        let mut stats = capture.run(config.capture.ticks)?;
        stats.discarded += discarded;

        tracing::info!(
            frames = stats.frames_written,
            dir = %writer.dir().display(),
            "capture complete"
        );

        Ok(RunSummary {
            vehicles: population.vehicles.len(),
            walkers: population.walkers.len(),
            camera_target: Some(target),
            capture: stats,
            ..Default::default()
        })
    }
}
