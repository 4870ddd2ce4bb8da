//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::sync::Arc;

use rbridge_core::home::engine_executable;
use rbridge_core::{ControllerConfig, EngineController, MemoryEngine};
use tempfile::TempDir;

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A directory laid out like an engine installation.
pub fn fake_home() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let exe = engine_executable(dir.path());
    fs::create_dir_all(exe.parent().expect("executable has a parent"))
        .expect("Failed to create bin dir");
    fs::write(&exe, "#!/bin/sh\n").expect("Failed to write engine executable");
    fs::create_dir_all(dir.path().join("library")).expect("Failed to create library dir");
    dir
}

/// A controller over a fresh memory engine, plus a handle to that engine.
pub struct Harness {
    pub home: TempDir,
    pub engine: MemoryEngine,
    pub controller: Arc<EngineController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(ControllerConfig) -> ControllerConfig) -> Self {
        init_tracing();
        let home = fake_home();
        let engine = MemoryEngine::new();
        let config = adjust(ControllerConfig {
            cancel_poll_interval_ms: 20,
            workspace_poll_interval_ms: 20,
            ..ControllerConfig::with_home(home.path())
        });
        let controller =
            EngineController::new(config, engine.clone()).expect("Failed to create controller");
        Self {
            home,
            engine,
            controller,
        }
    }
}
