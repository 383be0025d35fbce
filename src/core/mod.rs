pub mod config;
pub mod error;
pub mod types;

pub use config::RunConfig;
pub use error::{CaptureError, Result};
pub use types::{ActorId, Location, Rotation, Tick, Transform};
