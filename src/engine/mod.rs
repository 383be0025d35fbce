//! Simulator boundary
//!
//! The engine does physics, rendering, navigation and sensor simulation.
//! We only talk to it through [`Engine`]: batched spawn/destroy commands,
//! a handful of queries, tick synchronization, and sensor subscriptions.

pub mod blueprint;
pub mod remote;
pub mod sandbox;

use serde::{Deserialize, Serialize};

use crate::batch::{Command, CommandResponse};
use crate::core::error::Result;
use crate::core::types::{ActorId, Location, Tick, Transform};

pub use blueprint::{wildcard_match, Blueprint, BlueprintAttribute, BlueprintLibrary};
pub use remote::RemoteEngine;
pub use sandbox::{SandboxEngine, SandboxSettings};

/// One camera image in the engine's native B-G-R-A byte layout
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    /// Engine frame number the image was rendered at
    pub frame: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawImage {
    /// Bytes per pixel in the engine's raw layout
    pub const CHANNELS: usize = 4;

    /// Size in bytes of a `width` x `height` raw image
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::CHANNELS
    }
}

/// Invoked by the engine for every image a sensor produces
///
/// Runs on an engine-owned thread, never on the caller's.
pub type SensorCallback = Box<dyn Fn(RawImage) + Send + Sync + 'static>;

/// Commands accepted by a walker AI controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WalkerControl {
    Start,
    GoToLocation(Location),
    SetMaxSpeed(f32),
    Stop,
}

/// Remote command/query interface of the simulator
pub trait Engine {
    /// Replace the current world with the named map
    fn load_world(&self, map: &str) -> Result<()>;

    fn blueprint_library(&self) -> Result<BlueprintLibrary>;

    /// Transforms where vehicles are expected to spawn without colliding
    fn spawn_points(&self) -> Result<Vec<Transform>>;

    /// A random point on the pedestrian navigation mesh, if one was found
    fn random_navigable_location(&self) -> Result<Option<Location>>;

    /// Apply every command, returning one response per command in order
    fn apply_batch(&self, commands: &[Command], synchronous: bool) -> Result<Vec<CommandResponse>>;

    /// Spawn a single actor outside of a batch
    fn spawn_actor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> Result<ActorId>;

    fn actor_exists(&self, id: ActorId) -> Result<bool>;

    fn walker_control(&self, controller: ActorId, control: WalkerControl) -> Result<()>;

    /// Enroll or remove a vehicle from the engine's crowd movement control
    fn set_crowd_control(&self, vehicle: ActorId, enabled: bool) -> Result<()>;

    /// Block until the engine completes its next simulation step
    fn wait_for_tick(&self) -> Result<Tick>;

    fn listen(&self, sensor: ActorId, callback: SensorCallback) -> Result<()>;

    fn stop_listening(&self, sensor: ActorId) -> Result<()>;
}
