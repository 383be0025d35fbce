//! Population managers
//!
//! Bulk-create vehicles and pedestrians through batched commands and keep
//! registries of what was actually created.

pub mod blueprints;
pub mod vehicles;
pub mod walkers;

pub use vehicles::{enable_crowd_control, spawn_vehicles, VehicleRegistry};
pub use walkers::{spawn_walkers, WalkerRecord, WalkerRegistry, WALKER_SPEED_RANGE};
