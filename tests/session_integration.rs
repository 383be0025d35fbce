//! End-to-end runs against the sandbox engine
//!
//! A run must leave exactly one numbered frame per steady-state tick on disk
//! and nothing alive in the simulation, whether it finishes, times out or is
//! interrupted.

use npc_capture::core::config::RunConfig;
use npc_capture::core::error::CaptureError;
use npc_capture::engine::SandboxEngine;
use npc_capture::session::Session;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn small_config(output_dir: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.vehicles.count = 10;
    config.walkers.count = 25;
    config.camera.width = 16;
    config.camera.height = 12;
    config.capture.output_dir = output_dir.to_path_buf();
    config.seed = Some(42);
    config
}

fn frame_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_full_run_writes_one_frame_per_tick() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("frames");
    let engine = SandboxEngine::default();
    let cancel = Arc::new(AtomicBool::new(false));

    let summary = Session::new(&engine, small_config(&out), cancel).run().unwrap();

    assert_eq!(summary.seed, 42);
    assert_eq!(summary.vehicles, 10);
    assert!(summary.walkers >= 20);
    assert!(summary.camera_target.is_some());
    assert_eq!(summary.capture.frames_written, 2000);

    let names = frame_names(&out);
    assert_eq!(names.len(), 2000);
    assert_eq!(names.first().map(String::as_str), Some("test-0000.jpg"));
    assert_eq!(names.last().map(String::as_str), Some("test-1999.jpg"));
    for (tick, name) in names.iter().enumerate() {
        assert_eq!(name, &format!("test-{:04}.jpg", tick));
    }

    let frame = image::open(out.join("test-0500.jpg")).unwrap().to_rgb8();
    assert_eq!(frame.dimensions(), (16, 12));
}

#[test]
fn test_full_run_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SandboxEngine::default();
    let mut config = small_config(dir.path());
    config.capture.ticks = 50;

    let summary = Session::new(&engine, config, Arc::new(AtomicBool::new(false)))
        .run()
        .unwrap();

    assert!(engine.live_actors().is_empty());
    assert_eq!(engine.listener_count(), 0);
    assert_eq!(engine.loaded_map().as_deref(), Some("Town01"));

    let report = summary.teardown;
    assert!(report.camera_destroyed);
    assert_eq!(report.vehicles_destroyed, summary.vehicles);
    assert_eq!(report.controllers_stopped, summary.walkers);
    assert_eq!(report.walker_actors_destroyed, summary.walkers * 2);
    assert_eq!(report.failures, 0);
}

#[test]
fn test_same_seed_same_population() {
    let run = |dir: &Path| {
        let engine = SandboxEngine::default();
        let mut config = small_config(dir);
        config.capture.ticks = 5;
        Session::new(&engine, config, Arc::new(AtomicBool::new(false)))
            .run()
            .unwrap()
    };

    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let first = run(a.path());
    let second = run(b.path());

    assert_eq!(first.vehicles, second.vehicles);
    assert_eq!(first.walkers, second.walkers);
    assert_eq!(first.camera_target, second.camera_target);
}

#[test]
fn test_missing_frames_time_out_and_still_release() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SandboxEngine::default();
    engine.pause_sensors(true);

    let mut config = small_config(dir.path());
    config.capture.frame_timeout_secs = 0.2;

    let result = Session::new(&engine, config, Arc::new(AtomicBool::new(false))).run();

    assert!(matches!(result, Err(CaptureError::FrameTimeout { tick: 0, .. })));
    assert!(engine.live_actors().is_empty());
    assert!(frame_names(dir.path()).is_empty());
}

#[test]
fn test_interrupt_releases_partial_population() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SandboxEngine::default();
    let cancel = Arc::new(AtomicBool::new(true));

    let result = Session::new(&engine, small_config(dir.path()), cancel).run();

    assert!(matches!(result, Err(CaptureError::Interrupted)));
    assert!(engine.live_actors().is_empty());
}

#[test]
fn test_empty_population_has_no_camera_target() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SandboxEngine::default();
    let mut config = small_config(dir.path());
    config.vehicles.count = 0;
    config.walkers.count = 0;

    let result = Session::new(&engine, config, Arc::new(AtomicBool::new(false))).run();

    assert!(matches!(result, Err(CaptureError::NoCameraTarget)));
    assert!(engine.live_actors().is_empty());
}

#[test]
fn test_invalid_config_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SandboxEngine::default();
    let mut config = small_config(dir.path());
    config.camera.width = 0;

    let result = Session::new(&engine, config, Arc::new(AtomicBool::new(false))).run();

    assert!(matches!(result, Err(CaptureError::Config(_))));
    assert_eq!(engine.loaded_map(), None);
    assert_eq!(engine.current_tick(), 0);
}

#[test]
fn test_infinite_frame_timeout_is_rejected_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SandboxEngine::default();
    let mut config = small_config(dir.path());
    config.capture.frame_timeout_secs = f64::INFINITY;

    let result = Session::new(&engine, config, Arc::new(AtomicBool::new(false))).run();

    assert!(matches!(result, Err(CaptureError::Config(_))));
    assert_eq!(engine.loaded_map(), None);
    assert!(engine.live_actors().is_empty());
}
