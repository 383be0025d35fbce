//! Vehicle population
//!
//! One synchronous batch spawns every vehicle with autopilot chained onto
//! the spawn, so a vehicle never exists without being driven.

use rand::seq::SliceRandom;
use rand::Rng;

use super::blueprints::{self, AUTOPILOT_ROLE};
use crate::batch::{self, BatchResult, Command, SpawnRequest};
use crate::core::config::VehicleConfig;
use crate::core::error::{CaptureError, Result};
use crate::core::types::{ActorId, Transform};
use crate::engine::{Blueprint, BlueprintLibrary, Engine};

/// Attributes randomized per vehicle for visual variety
const VARIED_ATTRIBUTES: [&str; 2] = ["color", "driver_id"];

/// Vehicles successfully created, in spawn order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleRegistry {
    ids: Vec<ActorId>,
    crowd_controlled: Vec<ActorId>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &[ActorId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Vehicles currently enrolled in crowd movement control
    pub fn crowd_controlled(&self) -> &[ActorId] {
        &self.crowd_controlled
    }

    /// Record successes, log failures; returns how many were added
    pub fn ingest(&mut self, results: &[BatchResult]) -> usize {
        let before = self.ids.len();
        for result in results {
            match result {
                BatchResult::Ok(id) => self.ids.push(*id),
                BatchResult::Failed(error) => tracing::error!("{}", error),
            }
        }
        self.ids.len() - before
    }

    /// Hand the ids over for release, leaving the registry empty
    pub fn drain(&mut self) -> (Vec<ActorId>, Vec<ActorId>) {
        (std::mem::take(&mut self.ids), std::mem::take(&mut self.crowd_controlled))
    }
}

/// Choose which spawn points to use for `requested` vehicles
///
/// Fewer requests than points: shuffle and take a prefix so vehicles are not
/// clustered. More requests than points: use every point once and warn.
pub fn plan_spawn_points<R: Rng + ?Sized>(
    requested: usize,
    mut points: Vec<Transform>,
    rng: &mut R,
) -> Vec<Transform> {
    let available = points.len();
    if requested < available {
        points.shuffle(rng);
        points.truncate(requested);
    } else if requested > available {
        tracing::warn!(
            "requested {} vehicles, but could only find {} spawn points",
            requested,
            available
        );
    }
    points
}

/// One spawn-with-autopilot command per spawn point
pub fn build_vehicle_batch<R: Rng + ?Sized>(
    points: &[Transform],
    choices: &[Blueprint],
    rng: &mut R,
) -> Vec<Command> {
    points
        .iter()
        .filter_map(|transform| {
            let mut blueprint = blueprints::choose_varied(choices, &VARIED_ATTRIBUTES, rng)?;
            blueprint.set_attribute("role_name", AUTOPILOT_ROLE);
            Some(Command::spawn(
                SpawnRequest::new(blueprint, *transform).then(Command::autopilot_on_spawned(true)),
            ))
        })
        .collect()
}

/// Spawn up to `config.count` vehicles into `registry`
///
/// Returns the number of vehicles added. Individual spawn failures are
/// logged and skipped.
pub fn spawn_vehicles<R: Rng + ?Sized>(
    engine: &dyn Engine,
    library: &BlueprintLibrary,
    config: &VehicleConfig,
    rng: &mut R,
    registry: &mut VehicleRegistry,
) -> Result<usize> {
    if config.count == 0 {
        return Ok(0);
    }

    let mut choices = blueprints::matching(library, &config.filter)?;
    if config.safe {
        choices = blueprints::safe_vehicles(choices);
        if choices.is_empty() {
            return Err(CaptureError::NoBlueprints(format!("{} (safe)", config.filter)));
        }
    }

    let points = plan_spawn_points(config.count, engine.spawn_points()?, rng);
    let commands = build_vehicle_batch(&points, &choices, rng);
    let results = batch::submit(engine, &commands, true)?;
    let added = registry.ingest(&results);

    tracing::info!(requested = config.count, spawned = added, "vehicles spawned");
    Ok(added)
}

/// Enroll every registered vehicle in the engine's crowd movement control
pub fn enable_crowd_control(engine: &dyn Engine, registry: &mut VehicleRegistry) -> usize {
    for &id in &registry.ids {
        if registry.crowd_controlled.contains(&id) {
            continue;
        }
        match engine.set_crowd_control(id, true) {
            Ok(()) => registry.crowd_controlled.push(id),
            Err(e) => tracing::warn!(vehicle = %id, error = %e, "crowd control unavailable"),
        }
    }
    registry.crowd_controlled.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Location;
    use crate::engine::sandbox::default_library;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn points(n: usize) -> Vec<Transform> {
        (0..n).map(|i| Transform::at(Location::new(i as f32, 0.0, 0.0))).collect()
    }

    #[test]
    fn test_plan_takes_requested_prefix() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let planned = plan_spawn_points(4, points(10), &mut rng);
        assert_eq!(planned.len(), 4);

        let mut xs: Vec<i32> = planned.iter().map(|t| t.location.x as i32).collect();
        xs.sort();
        xs.dedup();
        assert_eq!(xs.len(), 4, "spawn points must not repeat");
    }

    #[test]
    fn test_plan_clamps_to_available() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(plan_spawn_points(5, points(3), &mut rng).len(), 3);
    }

    #[test]
    fn test_plan_exact_count_keeps_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(plan_spawn_points(3, points(3), &mut rng), points(3));
    }

    #[test]
    fn test_batch_chains_autopilot_and_role() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let choices = default_library().filter("vehicle.*");
        let commands = build_vehicle_batch(&points(3), &choices, &mut rng);

        assert_eq!(commands.len(), 3);
        for command in &commands {
            match command {
                Command::SpawnActor(request) => {
                    let role = request.blueprint.attribute("role_name").unwrap();
                    assert_eq!(role.value, AUTOPILOT_ROLE);
                    assert_eq!(request.then, vec![Command::autopilot_on_spawned(true)]);
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[test]
    fn test_ingest_skips_failures() {
        let mut registry = VehicleRegistry::new();
        let added = registry.ingest(&[
            BatchResult::Ok(ActorId(1)),
            BatchResult::Failed("collision".into()),
            BatchResult::Ok(ActorId(3)),
        ]);
        assert_eq!(added, 2);
        assert_eq!(registry.ids(), &[ActorId(1), ActorId(3)]);
    }
}
