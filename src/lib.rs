//! NPC Capture - populate a driving simulation and record a camera stream

pub mod batch;
pub mod capture;
pub mod core;
pub mod engine;
pub mod population;
pub mod session;
pub mod teardown;
