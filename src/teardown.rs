//! Release of everything a run created
//!
//! Whatever exists when the run ends (fully populated, half populated, or
//! nothing at all) is released in a fixed order:
//!
//! 1. the camera (stream first, then the actor)
//! 2. vehicle crowd control
//! 3. vehicles, one batch
//! 4. walker controllers are stopped
//! 5. walker controllers and bodies, one batch
//!
//! Destruction is best effort: failures are logged and never retried, and an
//! id the engine no longer knows is not an error. Registries are drained as
//! they are released, so a second teardown does nothing.

use crate::batch::{self, BatchResult, Command};
use crate::core::types::ActorId;
use crate::engine::{Engine, WalkerControl};
use crate::population::{VehicleRegistry, WalkerRegistry};

/// Everything a run has created so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Population {
    pub vehicles: VehicleRegistry,
    pub walkers: WalkerRegistry,
    pub camera: Option<ActorId>,
}

impl Population {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty() && self.walkers.is_empty() && self.camera.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub camera_destroyed: bool,
    pub vehicles_destroyed: usize,
    pub controllers_stopped: usize,
    /// Walker bodies and controllers together
    pub walker_actors_destroyed: usize,
    pub failures: usize,
}

/// Destroy ids in one synchronous batch; returns (destroyed, failed)
fn destroy_all(engine: &dyn Engine, ids: &[ActorId]) -> (usize, usize) {
    let commands: Vec<Command> = ids.iter().copied().map(Command::destroy).collect();
    match batch::submit(engine, &commands, true) {
        Ok(results) => {
            let mut destroyed = 0;
            for result in &results {
                match result {
                    BatchResult::Ok(_) => destroyed += 1,
                    BatchResult::Failed(error) => tracing::debug!("destroy skipped: {}", error),
                }
            }
            (destroyed, results.len() - destroyed)
        }
        Err(e) => {
            tracing::warn!(actors = ids.len(), error = %e, "destroy batch failed");
            (0, ids.len())
        }
    }
}

/// Release every actor in `population`, leaving it empty
pub fn teardown(engine: &dyn Engine, population: &mut Population) -> TeardownReport {
    let mut report = TeardownReport::default();
    if population.is_empty() {
        return report;
    }

    if let Some(camera) = population.camera.take() {
        if let Err(e) = engine.stop_listening(camera) {
            tracing::warn!(%camera, error = %e, "could not stop camera stream");
        }
        let (destroyed, failed) = destroy_all(engine, &[camera]);
        report.camera_destroyed = destroyed == 1;
        report.failures += failed;
    }

    let (vehicles, crowd_controlled) = population.vehicles.drain();
    for id in crowd_controlled {
        if let Err(e) = engine.set_crowd_control(id, false) {
            tracing::debug!(vehicle = %id, error = %e, "could not leave crowd control");
        }
    }

    tracing::info!("destroying {} vehicles", vehicles.len());
    let (destroyed, failed) = destroy_all(engine, &vehicles);
    report.vehicles_destroyed = destroyed;
    report.failures += failed;

    let walkers = population.walkers.drain();
    for controller in walkers.iter().filter_map(|r| r.controller) {
        match engine.walker_control(controller, WalkerControl::Stop) {
            Ok(()) => report.controllers_stopped += 1,
            Err(e) => tracing::debug!(%controller, error = %e, "could not stop walker controller"),
        }
    }

    let walker_ids: Vec<ActorId> = walkers
        .iter()
        .flat_map(|r| r.controller.into_iter().chain(std::iter::once(r.body)))
        .collect();
    tracing::info!("destroying {} walkers", walkers.len());
    let (destroyed, failed) = destroy_all(engine, &walker_ids);
    report.walker_actors_destroyed = destroyed;
    report.failures += failed;

    report
}

/// Owns the population and releases it on every exit path
///
/// Call [`PopulationGuard::release`] for the normal path; an early return or
/// a panic releases through `Drop` instead.
pub struct PopulationGuard<'e> {
    engine: &'e dyn Engine,
    population: Population,
}

impl<'e> PopulationGuard<'e> {
    pub fn new(engine: &'e dyn Engine) -> Self {
        Self {
            engine,
            population: Population::new(),
        }
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    pub fn release(mut self) -> TeardownReport {
        teardown(self.engine, &mut self.population)
    }
}

impl Drop for PopulationGuard<'_> {
    fn drop(&mut self) {
        if !self.population.is_empty() {
            let report = teardown(self.engine, &mut self.population);
            tracing::info!(?report, "population released on early exit");
        }
    }
}
