//! In-process engine for tests and offline runs
//!
//! Mimics the behaviors the population code has to cope with: spawn
//! collisions, navigation misses, deferred visibility for asynchronous
//! batches, controllers that are unaddressable until a tick has passed, and
//! sensor callbacks delivered on a separate thread.

use crossbeam_channel::{unbounded, Sender};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::{
    Blueprint, BlueprintAttribute, BlueprintLibrary, Engine, RawImage, SensorCallback,
    WalkerControl,
};
use crate::batch::{self, Command, CommandResponse, CommandSink};
use crate::core::error::{CaptureError, Result};
use crate::core::types::{ActorId, Location, Rotation, Tick, Transform};

/// Vehicles closer than this to each other collide on spawn
const COLLISION_RADIUS: f32 = 0.5;

/// Spacing of the spawn point grid in meters
const SPAWN_GRID_SPACING: f32 = 10.0;

/// Side of the square area navigation samples are drawn from
const NAV_EXTENT: f32 = 200.0;

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub spawn_points: usize,
    /// Probability that a navigation query finds nothing
    pub nav_miss_rate: f64,
    pub seed: u64,
    pub library: BlueprintLibrary,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            spawn_points: 150,
            nav_miss_rate: 0.05,
            seed: 0,
            library: default_library(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    Vehicle,
    Walker,
    WalkerController,
    Sensor,
    Other,
}

impl ActorKind {
    fn of(blueprint_id: &str) -> Self {
        if blueprint_id.starts_with("vehicle.") {
            ActorKind::Vehicle
        } else if blueprint_id.starts_with("walker.") {
            ActorKind::Walker
        } else if blueprint_id == "controller.ai.walker" {
            ActorKind::WalkerController
        } else if blueprint_id.starts_with("sensor.") {
            ActorKind::Sensor
        } else {
            ActorKind::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    pub started: bool,
    pub target: Option<Location>,
    pub max_speed: Option<f32>,
}

/// Snapshot of one simulated actor
#[derive(Debug, Clone)]
pub struct SandboxActor {
    pub blueprint: String,
    pub kind: ActorKind,
    pub attributes: BTreeMap<String, String>,
    pub transform: Transform,
    pub parent: Option<ActorId>,
    pub spawned_at: Tick,
    pub visible_from: Tick,
    pub retire_at: Option<Tick>,
    pub autopilot: bool,
    pub crowd_control: bool,
    pub controller: Option<ControllerState>,
}

struct Delivery {
    callback: Arc<SensorCallback>,
    image: RawImage,
}

struct SandboxState {
    library: BlueprintLibrary,
    spawn_points: Vec<Transform>,
    nav_miss_rate: f64,
    rng: ChaCha8Rng,
    map: Option<String>,
    tick: Tick,
    next_id: u32,
    actors: BTreeMap<ActorId, SandboxActor>,
    listeners: HashMap<ActorId, Arc<SensorCallback>>,
    failing_items: HashSet<usize>,
    sensors_paused: bool,
}

impl SandboxState {
    fn is_visible(&self, actor: &SandboxActor) -> bool {
        self.tick >= actor.visible_from
    }

    fn spawn(
        &mut self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
        synchronous: bool,
    ) -> std::result::Result<ActorId, String> {
        let known = self.library.find(&blueprint.id).map_err(|e| e.to_string())?;
        let kind = ActorKind::of(&known.id);

        if let Some(parent_id) = parent {
            let parent_actor = self
                .actors
                .get(&parent_id)
                .filter(|a| a.retire_at.is_none())
                .ok_or_else(|| format!("parent {} not found", parent_id))?;
            if kind == ActorKind::WalkerController && parent_actor.kind != ActorKind::Walker {
                return Err(format!(
                    "walker controller cannot be attached to {}",
                    parent_actor.blueprint
                ));
            }
        } else if kind == ActorKind::WalkerController {
            return Err("walker controller needs a parent walker".into());
        }

        if kind == ActorKind::Vehicle {
            let blocked = self.actors.values().any(|a| {
                a.kind == ActorKind::Vehicle
                    && a.retire_at.is_none()
                    && a.transform.location.distance(&transform.location) < COLLISION_RADIUS
            });
            if blocked {
                return Err("Spawn failed because of collision at spawn position".into());
            }
        }

        self.next_id += 1;
        let id = ActorId(self.next_id);
        let attributes = blueprint
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();
        self.actors.insert(
            id,
            SandboxActor {
                blueprint: blueprint.id.clone(),
                kind,
                attributes,
                transform: *transform,
                parent,
                spawned_at: self.tick,
                visible_from: if synchronous { self.tick } else { self.tick + 1 },
                retire_at: None,
                autopilot: false,
                crowd_control: false,
                controller: (kind == ActorKind::WalkerController).then(ControllerState::default),
            },
        );
        Ok(id)
    }

    fn destroy(&mut self, id: ActorId, synchronous: bool) -> std::result::Result<(), String> {
        let live = self.actors.get(&id).map(|a| a.retire_at.is_none()).unwrap_or(false);
        if !live {
            return Err(format!("actor {} not found", id));
        }

        if synchronous {
            self.actors.remove(&id);
            self.listeners.remove(&id);
        } else {
            let retire_at = self.tick + 1;
            if let Some(actor) = self.actors.get_mut(&id) {
                actor.retire_at = Some(retire_at);
            }
        }
        Ok(())
    }

    fn live_actor_mut(&mut self, id: ActorId) -> Result<&mut SandboxActor> {
        match self.actors.get_mut(&id) {
            Some(actor) if actor.retire_at.is_none() => Ok(actor),
            _ => Err(CaptureError::ActorNotFound(id)),
        }
    }

    fn render(&self, sensor: ActorId) -> Option<RawImage> {
        let actor = self.actors.get(&sensor)?;
        let dim = |key: &str, fallback: u32| {
            actor.attributes.get(key).and_then(|v| v.parse().ok()).unwrap_or(fallback)
        };
        let width = dim("image_size_x", 800);
        let height = dim("image_size_y", 600);

        let mut data = Vec::with_capacity(RawImage::byte_len(width, height));
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[
                    (x as u64 + self.tick) as u8,
                    y as u8,
                    self.tick as u8,
                    255,
                ]);
            }
        }
        Some(RawImage {
            frame: self.tick,
            width,
            height,
            data,
        })
    }
}

/// Executes batch items against the sandbox state
struct BatchSink<'a> {
    state: &'a mut SandboxState,
    synchronous: bool,
}

impl CommandSink for BatchSink<'_> {
    fn spawn(
        &mut self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> std::result::Result<ActorId, String> {
        self.state.spawn(blueprint, transform, parent, self.synchronous)
    }

    fn set_autopilot(&mut self, actor: ActorId, enabled: bool) -> std::result::Result<(), String> {
        match self.state.actors.get_mut(&actor) {
            Some(a) if a.kind == ActorKind::Vehicle => {
                a.autopilot = enabled;
                Ok(())
            }
            Some(a) => Err(format!("{} ({}) has no autopilot", actor, a.blueprint)),
            None => Err(format!("actor {} not found", actor)),
        }
    }

    fn destroy(&mut self, actor: ActorId) -> std::result::Result<(), String> {
        self.state.destroy(actor, self.synchronous)
    }
}

/// Deterministic in-process simulator
pub struct SandboxEngine {
    state: Mutex<SandboxState>,
    delivery: Mutex<Option<Sender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxEngine {
    pub fn new(settings: SandboxSettings) -> Self {
        let spawn_points = (0..settings.spawn_points)
            .map(|i| {
                let x = (i % 10) as f32 * SPAWN_GRID_SPACING;
                let y = (i / 10) as f32 * SPAWN_GRID_SPACING;
                Transform::new(
                    Location::new(x, y, 0.3),
                    Rotation::new(0.0, if i % 2 == 0 { 0.0 } else { 180.0 }, 0.0),
                )
            })
            .collect();

        let (tx, rx) = unbounded::<Delivery>();
        let worker = thread::Builder::new()
            .name("sandbox-sensors".into())
            .spawn(move || {
                for delivery in rx {
                    (delivery.callback)(delivery.image);
                }
            })
            .ok();

        Self {
            state: Mutex::new(SandboxState {
                library: settings.library,
                spawn_points,
                nav_miss_rate: settings.nav_miss_rate.clamp(0.0, 1.0),
                rng: ChaCha8Rng::seed_from_u64(settings.seed),
                map: None,
                tick: 0,
                next_id: 0,
                actors: BTreeMap::new(),
                listeners: HashMap::new(),
                failing_items: HashSet::new(),
                sensors_paused: false,
            }),
            delivery: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SandboxState>> {
        self.state.lock().map_err(|_| CaptureError::Engine("sandbox state poisoned".into()))
    }

    /// Make the given item indices of the next batch fail
    pub fn fail_next_batch_items(&self, indices: &[usize]) {
        if let Ok(mut state) = self.lock() {
            state.failing_items = indices.iter().copied().collect();
        }
    }

    /// Stop (or resume) producing sensor frames
    pub fn pause_sensors(&self, paused: bool) {
        if let Ok(mut state) = self.lock() {
            state.sensors_paused = paused;
        }
    }

    pub fn loaded_map(&self) -> Option<String> {
        self.lock().ok().and_then(|s| s.map.clone())
    }

    pub fn current_tick(&self) -> Tick {
        self.lock().map(|s| s.tick).unwrap_or_default()
    }

    pub fn actor(&self, id: ActorId) -> Option<SandboxActor> {
        self.lock().ok().and_then(|s| s.actors.get(&id).cloned())
    }

    /// Ids of every actor not yet destroyed, visible or not
    pub fn live_actors(&self) -> Vec<ActorId> {
        self.lock()
            .map(|s| {
                s.actors
                    .iter()
                    .filter(|(_, a)| a.retire_at.is_none())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().map(|s| s.listeners.len()).unwrap_or_default()
    }
}

impl Default for SandboxEngine {
    fn default() -> Self {
        Self::new(SandboxSettings::default())
    }
}

impl Drop for SandboxEngine {
    fn drop(&mut self) {
        if let Ok(mut delivery) = self.delivery.lock() {
            delivery.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Engine for SandboxEngine {
    fn load_world(&self, map: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.actors.clear();
        state.listeners.clear();
        state.map = Some(map.to_string());
        tracing::debug!(map, "sandbox world loaded");
        Ok(())
    }

    fn blueprint_library(&self) -> Result<BlueprintLibrary> {
        Ok(self.lock()?.library.clone())
    }

    fn spawn_points(&self) -> Result<Vec<Transform>> {
        Ok(self.lock()?.spawn_points.clone())
    }

    fn random_navigable_location(&self) -> Result<Option<Location>> {
        let mut state = self.lock()?;
        let miss_rate = state.nav_miss_rate;
        if state.rng.gen_bool(miss_rate) {
            return Ok(None);
        }
        let x = state.rng.gen_range(0.0..NAV_EXTENT);
        let y = state.rng.gen_range(0.0..NAV_EXTENT);
        Ok(Some(Location::new(x, y, 1.0)))
    }

    fn apply_batch(&self, commands: &[Command], synchronous: bool) -> Result<Vec<CommandResponse>> {
        let mut state = self.lock()?;
        let failing = std::mem::take(&mut state.failing_items);

        let mut responses = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            if failing.contains(&index) {
                let reason = format!("injected failure at item {}", index);
                responses.push(CommandResponse::failed(reason));
                continue;
            }
            let mut sink = BatchSink {
                state: &mut *state,
                synchronous,
            };
            responses.extend(batch::execute(&mut sink, std::slice::from_ref(command)));
        }
        Ok(responses)
    }

    fn spawn_actor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> Result<ActorId> {
        self.lock()?.spawn(blueprint, transform, parent, true).map_err(CaptureError::Engine)
    }

    fn actor_exists(&self, id: ActorId) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.actors.get(&id).map(|a| state.is_visible(a)).unwrap_or(false))
    }

    fn walker_control(&self, controller: ActorId, control: WalkerControl) -> Result<()> {
        let mut state = self.lock()?;
        let tick = state.tick;
        let actor = state.live_actor_mut(controller)?;
        if actor.spawned_at >= tick {
            return Err(CaptureError::Engine(format!(
                "{} has not been received by the client yet",
                controller
            )));
        }
        let ctrl = actor
            .controller
            .as_mut()
            .ok_or_else(|| {
                CaptureError::Engine(format!("{} is not a walker controller", controller))
            })?;

        match control {
            WalkerControl::Start => ctrl.started = true,
            WalkerControl::GoToLocation(target) => ctrl.target = Some(target),
            WalkerControl::SetMaxSpeed(speed) => ctrl.max_speed = Some(speed),
            WalkerControl::Stop => {
                ctrl.started = false;
                ctrl.target = None;
            }
        }
        Ok(())
    }

    fn set_crowd_control(&self, vehicle: ActorId, enabled: bool) -> Result<()> {
        let mut state = self.lock()?;
        let actor = state.live_actor_mut(vehicle)?;
        if actor.kind != ActorKind::Vehicle {
            return Err(CaptureError::Engine(format!("{} is not a vehicle", vehicle)));
        }
        actor.crowd_control = enabled;
        Ok(())
    }

    fn wait_for_tick(&self) -> Result<Tick> {
        let (tick, deliveries) = {
            let mut state = self.lock()?;
            state.tick += 1;
            let tick = state.tick;

            let retired: Vec<ActorId> = state
                .actors
                .iter()
                .filter(|(_, a)| a.retire_at.map(|t| t <= tick).unwrap_or(false))
                .map(|(id, _)| *id)
                .collect();
            for id in retired {
                state.actors.remove(&id);
                state.listeners.remove(&id);
            }

            let deliveries: Vec<Delivery> = if state.sensors_paused {
                Vec::new()
            } else {
                let mut sensors: Vec<ActorId> = state.listeners.keys().copied().collect();
                sensors.sort();
                sensors
                    .into_iter()
                    .filter_map(|sensor| {
                        let image = state.render(sensor)?;
                        let callback = Arc::clone(state.listeners.get(&sensor)?);
                        Some(Delivery { callback, image })
                    })
                    .collect()
            };
            (tick, deliveries)
        };

        let delivery = self
            .delivery
            .lock()
            .map_err(|_| CaptureError::Engine("sensor delivery poisoned".into()))?;
        if let Some(tx) = delivery.as_ref() {
            for d in deliveries {
                tx.send(d).map_err(|_| CaptureError::SensorDisconnected)?;
            }
        }
        Ok(tick)
    }

    fn listen(&self, sensor: ActorId, callback: SensorCallback) -> Result<()> {
        let mut state = self.lock()?;
        let actor = state.live_actor_mut(sensor)?;
        if actor.kind != ActorKind::Sensor {
            return Err(CaptureError::Engine(format!("{} is not a sensor", sensor)));
        }
        state.listeners.insert(sensor, Arc::new(callback));
        Ok(())
    }

    fn stop_listening(&self, sensor: ActorId) -> Result<()> {
        self.lock()?.listeners.remove(&sensor);
        Ok(())
    }
}

/// Blueprint set modelled on a stock town: cars, bikes, pedestrians, a
/// walker controller and an RGB camera
pub fn default_library() -> BlueprintLibrary {
    let colors = ["17,37,103", "246,246,246", "0,0,0", "183,187,162", "102,0,0"];
    let car = |id: &str| {
        Blueprint::new(id)
            .with_tags(&["vehicle", "car"])
            .with_attribute("number_of_wheels", BlueprintAttribute::new("4"))
            .with_attribute("color", BlueprintAttribute::with_recommended(colors[0], &colors))
            .with_attribute("role_name", BlueprintAttribute::new(""))
    };
    let bike = |id: &str| {
        Blueprint::new(id)
            .with_tags(&["vehicle", "bike"])
            .with_attribute("number_of_wheels", BlueprintAttribute::new("2"))
            .with_attribute(
                "driver_id",
                BlueprintAttribute::with_recommended("0", &["0", "1", "2"]),
            )
            .with_attribute("role_name", BlueprintAttribute::new(""))
    };
    let pedestrian = |id: &str| {
        Blueprint::new(id)
            .with_tags(&["walker", "pedestrian"])
            .with_attribute(
                "is_invincible",
                BlueprintAttribute::with_recommended("true", &["true", "false"]),
            )
            .with_attribute("speed", BlueprintAttribute::with_recommended("1.4", &["1.4", "2.8"]))
    };

    BlueprintLibrary::new(vec![
        car("vehicle.audi.a2"),
        car("vehicle.tesla.model3"),
        car("vehicle.nissan.micra"),
        car("vehicle.bmw.isetta"),
        car("vehicle.carlamotors.carlacola"),
        bike("vehicle.yamaha.yzf"),
        bike("vehicle.gazelle.omafiets"),
        pedestrian("walker.pedestrian.0001"),
        pedestrian("walker.pedestrian.0002"),
        pedestrian("walker.pedestrian.0003"),
        pedestrian("walker.pedestrian.0004"),
        Blueprint::new("controller.ai.walker").with_tags(&["controller", "walker"]),
        Blueprint::new("sensor.camera.rgb")
            .with_tags(&["sensor", "camera"])
            .with_attribute("image_size_x", BlueprintAttribute::new("800"))
            .with_attribute("image_size_y", BlueprintAttribute::new("600"))
            .with_attribute("fov", BlueprintAttribute::new("90")),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SpawnRequest;
    use std::sync::mpsc;
    use std::time::Duration;

    fn car() -> Blueprint {
        default_library().find("vehicle.audi.a2").unwrap()
    }

    #[test]
    fn test_async_spawn_visible_after_tick() {
        let engine = SandboxEngine::default();
        let spawn = Command::spawn(SpawnRequest::new(car(), Transform::default()));

        let responses = engine.apply_batch(&[spawn], false).unwrap();
        let id = responses[0].actor_id.unwrap();

        assert!(!engine.actor_exists(id).unwrap());
        engine.wait_for_tick().unwrap();
        assert!(engine.actor_exists(id).unwrap());
    }

    #[test]
    fn test_vehicle_collision_on_same_spawn_point() {
        let engine = SandboxEngine::default();
        let spawn = Command::spawn(SpawnRequest::new(car(), Transform::default()));

        let responses = engine.apply_batch(&[spawn.clone(), spawn], true).unwrap();

        assert!(responses[0].error.is_none());
        assert!(responses[1].error.as_deref().unwrap().contains("collision"));
    }

    #[test]
    fn test_controller_needs_a_tick_before_commands() {
        let engine = SandboxEngine::default();
        let library = default_library();
        let body = library.find("walker.pedestrian.0001").unwrap();
        let ai = library.find("controller.ai.walker").unwrap();
        let walker = engine.spawn_actor(&body, &Transform::default(), None).unwrap();
        let controller = engine
            .spawn_actor(&ai, &Transform::default(), Some(walker))
            .unwrap();

        assert!(engine.walker_control(controller, WalkerControl::Start).is_err());
        engine.wait_for_tick().unwrap();
        engine.walker_control(controller, WalkerControl::Start).unwrap();
        assert!(engine.actor(controller).unwrap().controller.unwrap().started);
    }

    #[test]
    fn test_controller_requires_walker_parent() {
        let engine = SandboxEngine::default();
        let library = default_library();
        let vehicle = engine.spawn_actor(&car(), &Transform::default(), None).unwrap();
        let ai = library.find("controller.ai.walker").unwrap();
        let result = engine.spawn_actor(&ai, &Transform::default(), Some(vehicle));
        assert!(result.is_err());
    }

    #[test]
    fn test_injected_failures_apply_to_next_batch_only() {
        let engine = SandboxEngine::default();
        let points = engine.spawn_points().unwrap();
        let batch: Vec<Command> = points[..3]
            .iter()
            .map(|t| Command::spawn(SpawnRequest::new(car(), *t)))
            .collect();

        engine.fail_next_batch_items(&[1]);
        let first = engine.apply_batch(&batch[..2], true).unwrap();
        assert!(first[0].error.is_none());
        assert!(first[1].error.is_some());

        let second = engine.apply_batch(&batch[2..], true).unwrap();
        assert!(second[0].error.is_none());
    }

    #[test]
    fn test_sensor_frames_delivered_off_thread() {
        let engine = SandboxEngine::default();
        let mut camera_bp = default_library().find("sensor.camera.rgb").unwrap();
        camera_bp.set_attribute("image_size_x", "4");
        camera_bp.set_attribute("image_size_y", "3");
        let camera = engine.spawn_actor(&camera_bp, &Transform::default(), None).unwrap();

        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        engine
            .listen(
                camera,
                Box::new(move |image| {
                    let _ = tx.send((thread::current().id(), image));
                }),
            )
            .unwrap();

        let tick = engine.wait_for_tick().unwrap();
        let (thread_id, image) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_ne!(thread_id, caller);
        assert_eq!(image.frame, tick);
        assert_eq!(image.data.len(), 4 * 3 * 4);
    }

    #[test]
    fn test_nav_miss_rate_one_never_finds_location() {
        let engine = SandboxEngine::new(SandboxSettings {
            nav_miss_rate: 1.0,
            ..Default::default()
        });
        for _ in 0..10 {
            assert!(engine.random_navigable_location().unwrap().is_none());
        }
    }
}
