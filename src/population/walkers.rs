//! Pedestrian population
//!
//! Walkers are built in strictly ordered rounds, each needing the ids the
//! previous round produced:
//!
//! 1. sample navigable spawn locations
//! 2. spawn the bodies (one synchronous batch)
//! 3. spawn one AI controller per body, parented to it (one synchronous batch)
//! 4. after a tick, start each controller, send it somewhere, set its speed
//!
//! A body whose controller failed to spawn stays in the registry so it is
//! still destroyed later, but is never initialized.

use rand::Rng;
use std::ops::Range;

use super::blueprints;
use crate::batch::{self, BatchResult, Command, SpawnRequest};
use crate::core::config::WalkerConfig;
use crate::core::error::Result;
use crate::core::types::{ActorId, Transform};
use crate::engine::{Blueprint, BlueprintLibrary, Engine, WalkerControl};

/// Max walking speed assigned to controllers, in m/s
pub const WALKER_SPEED_RANGE: Range<f32> = 1.0..2.0;

/// Navigation samples tried for a controller's destination
const DESTINATION_ATTEMPTS: usize = 3;

/// A pedestrian body and, once spawned, the controller driving it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerRecord {
    pub body: ActorId,
    pub controller: Option<ActorId>,
}

impl WalkerRecord {
    pub fn new(body: ActorId) -> Self {
        Self {
            body,
            controller: None,
        }
    }
}

/// Walkers successfully created, in spawn order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalkerRegistry {
    records: Vec<WalkerRecord>,
}

impl WalkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[WalkerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn body(&self, index: usize) -> Option<ActorId> {
        self.records.get(index).map(|r| r.body)
    }

    /// `(body, controller)` for every walker that has a controller
    pub fn controlled(&self) -> impl Iterator<Item = (ActorId, ActorId)> + '_ {
        self.records
            .iter()
            .filter_map(|r| r.controller.map(|controller| (r.body, controller)))
    }

    /// Add a record for every spawned body; returns how many were added
    pub fn ingest_bodies(&mut self, results: &[BatchResult]) -> usize {
        let before = self.records.len();
        for result in results {
            match result {
                BatchResult::Ok(id) => self.records.push(WalkerRecord::new(*id)),
                BatchResult::Failed(error) => tracing::error!("{}", error),
            }
        }
        self.records.len() - before
    }

    /// Indices of records still waiting for a controller
    fn uncontrolled(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.controller.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Attach controllers; `results[i]` belongs to record `indices[i]`
    fn attach_controllers(&mut self, indices: &[usize], results: &[BatchResult]) -> usize {
        let mut attached = 0;
        for (&index, result) in indices.iter().zip(results) {
            match result {
                BatchResult::Ok(id) => {
                    self.records[index].controller = Some(*id);
                    attached += 1;
                }
                BatchResult::Failed(error) => tracing::error!("{}", error),
            }
        }
        attached
    }

    /// Hand the records over for release, leaving the registry empty
    pub fn drain(&mut self) -> Vec<WalkerRecord> {
        std::mem::take(&mut self.records)
    }
}

/// Ask the engine for navigable spawn locations until `count` are found
///
/// Misses are dropped and re-sampled, up to `count * attempts_per_walker`
/// queries in total.
pub fn sample_spawn_locations(
    engine: &dyn Engine,
    count: usize,
    attempts_per_walker: usize,
) -> Result<Vec<Transform>> {
    let budget = count.saturating_mul(attempts_per_walker.max(1));
    let mut locations = Vec::with_capacity(count);
    let mut misses = 0;

    for _ in 0..budget {
        if locations.len() >= count {
            break;
        }
        match engine.random_navigable_location()? {
            Some(location) => locations.push(Transform::at(location)),
            None => {
                misses += 1;
                tracing::debug!("no navigable location found, resampling");
            }
        }
    }

    if locations.len() < count {
        tracing::warn!(
            "found only {} of {} walker spawn locations after {} misses",
            locations.len(),
            count,
            misses
        );
    }
    Ok(locations)
}

/// One spawn command per location with a random, vulnerable pedestrian
pub fn build_walker_batch<R: Rng + ?Sized>(
    locations: &[Transform],
    choices: &[Blueprint],
    rng: &mut R,
) -> Vec<Command> {
    locations
        .iter()
        .filter_map(|transform| {
            let mut blueprint = blueprints::choose_varied(choices, &[], rng)?;
            if blueprint.has_attribute("is_invincible") {
                blueprint.set_attribute("is_invincible", "false");
            }
            Some(Command::spawn(SpawnRequest::new(blueprint, *transform)))
        })
        .collect()
}

/// Round 2: spawn bodies and register the ones that made it
pub fn spawn_bodies(
    engine: &dyn Engine,
    commands: &[Command],
    registry: &mut WalkerRegistry,
) -> Result<usize> {
    let results = batch::submit(engine, commands, true)?;
    Ok(registry.ingest_bodies(&results))
}

/// Round 3: spawn a controller for every body that lacks one
pub fn spawn_controllers(
    engine: &dyn Engine,
    controller: &Blueprint,
    registry: &mut WalkerRegistry,
) -> Result<usize> {
    let indices = registry.uncontrolled();
    let commands: Vec<Command> = indices
        .iter()
        .map(|&i| {
            let request = SpawnRequest::new(controller.clone(), Transform::default());
            Command::spawn(request.attached_to(registry.records[i].body))
        })
        .collect();

    let results = batch::submit(engine, &commands, true)?;
    Ok(registry.attach_controllers(&indices, &results))
}

pub fn random_walker_speed<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    rng.gen_range(WALKER_SPEED_RANGE)
}

/// Round 4: start every controller, give it a destination and a speed
///
/// Waits for one tick first; freshly spawned controllers are not
/// addressable before the client has seen a tick that contains them.
/// Returns how many controllers were fully initialized.
pub fn initialize_controllers<R: Rng + ?Sized>(
    engine: &dyn Engine,
    registry: &WalkerRegistry,
    rng: &mut R,
) -> Result<usize> {
    engine.wait_for_tick()?;

    let mut initialized = 0;
    for (body, controller) in registry.controlled() {
        if let Err(e) = engine.walker_control(controller, WalkerControl::Start) {
            tracing::warn!(walker = %body, error = %e, "could not start walker controller");
            continue;
        }

        let mut destination = None;
        for _ in 0..DESTINATION_ATTEMPTS {
            destination = engine.random_navigable_location()?;
            if destination.is_some() {
                break;
            }
        }
        match destination {
            Some(target) => {
                let go = WalkerControl::GoToLocation(target);
                if let Err(e) = engine.walker_control(controller, go) {
                    tracing::warn!(walker = %body, error = %e, "could not set walker destination");
                }
            }
            None => {
                tracing::warn!(walker = %body, "no destination found, walker started without one")
            }
        }

        let speed = random_walker_speed(rng);
        if let Err(e) = engine.walker_control(controller, WalkerControl::SetMaxSpeed(speed)) {
            tracing::warn!(walker = %body, error = %e, "could not set walker speed");
            continue;
        }
        initialized += 1;
    }
    Ok(initialized)
}

/// Run all four rounds, registering walkers into `registry` as they appear
///
/// Records land in the registry as soon as their batch returns, so a failure
/// in a later round still leaves everything created so far releasable.
pub fn spawn_walkers<R: Rng + ?Sized>(
    engine: &dyn Engine,
    library: &BlueprintLibrary,
    config: &WalkerConfig,
    rng: &mut R,
    registry: &mut WalkerRegistry,
) -> Result<usize> {
    if config.count == 0 {
        return Ok(0);
    }

    let choices = blueprints::matching(library, &config.filter)?;
    let controller = library.find(&config.controller_blueprint)?;

    let locations =
        sample_spawn_locations(engine, config.count, config.location_attempts_per_walker)?;
    let commands = build_walker_batch(&locations, &choices, rng);
    let bodies = spawn_bodies(engine, &commands, registry)?;
    let controllers = spawn_controllers(engine, &controller, registry)?;
    let initialized = initialize_controllers(engine, registry, rng)?;

    tracing::info!(
        requested = config.count,
        bodies,
        controllers,
        initialized,
        "walkers spawned"
    );
    Ok(bodies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::{default_library, SandboxEngine, SandboxSettings};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_controlled_skips_missing_controllers() {
        let mut registry = WalkerRegistry::new();
        registry.ingest_bodies(&[BatchResult::Ok(ActorId(1)), BatchResult::Ok(ActorId(2))]);
        let indices = registry.uncontrolled();
        registry.attach_controllers(
            &indices,
            &[BatchResult::Failed("nope".into()), BatchResult::Ok(ActorId(10))],
        );

        let pairs: Vec<_> = registry.controlled().collect();
        assert_eq!(pairs, vec![(ActorId(2), ActorId(10))]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_walker_batch_disables_invincibility() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let choices = default_library().filter("walker.pedestrian.*");
        let locations = vec![Transform::default(); 5];

        for command in build_walker_batch(&locations, &choices, &mut rng) {
            match command {
                Command::SpawnActor(request) => {
                    let invincible = request.blueprint.attribute("is_invincible").unwrap();
                    assert_eq!(invincible.value, "false");
                    assert!(request.then.is_empty());
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[test]
    fn test_sampling_resamples_misses() {
        let engine = SandboxEngine::new(SandboxSettings {
            nav_miss_rate: 0.5,
            ..Default::default()
        });
        let locations = sample_spawn_locations(&engine, 20, 10).unwrap();
        assert_eq!(locations.len(), 20);
    }

    #[test]
    fn test_sampling_gives_up_after_budget() {
        let engine = SandboxEngine::new(SandboxSettings {
            nav_miss_rate: 1.0,
            ..Default::default()
        });
        let locations = sample_spawn_locations(&engine, 5, 2).unwrap();
        assert!(locations.is_empty());
    }

    #[test]
    fn test_initialize_waits_for_tick() {
        let engine = SandboxEngine::default();
        let library = default_library();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut registry = WalkerRegistry::new();

        let locations = sample_spawn_locations(&engine, 3, 10).unwrap();
        let commands = build_walker_batch(&locations, &library.filter("walker.*"), &mut rng);
        spawn_bodies(&engine, &commands, &mut registry).unwrap();
        let controller = library.find("controller.ai.walker").unwrap();
        spawn_controllers(&engine, &controller, &mut registry).unwrap();

        let before = engine.current_tick();
        let initialized = initialize_controllers(&engine, &registry, &mut rng).unwrap();

        assert_eq!(initialized, 3);
        assert!(engine.current_tick() > before);
        for (_, controller) in registry.controlled() {
            let state = engine.actor(controller).unwrap().controller.unwrap();
            assert!(state.started);
            assert!(state.target.is_some());
            let speed = state.max_speed.unwrap();
            assert!(WALKER_SPEED_RANGE.contains(&speed));
        }
    }
}
