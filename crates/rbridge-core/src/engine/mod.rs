//! The engine handle and its implementations.
//!
//! An [`Engine`] is a single-threaded, non-reentrant interpreter. Every call
//! goes through its [`CallSlot`]; `interrupt` is the only operation that may
//! be invoked while another thread is inside the engine.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryEngine`]: a pure-Rust interpreter for a small subset of the
//!   engine language, with host-registered functions.
//! - [`NativeEngine`]: a binding to the native bridge library, loaded at
//!   runtime with `libloading`.

pub mod memory;
pub mod native;
mod slot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryEngine;
pub use native::{NativeEngine, NativeEngineFactory};
pub use slot::{CallSlot, EngineLock, SlotGuard};

use crate::error::Result;
use crate::value::EngineValue;

/// Handle to the embedded engine.
pub trait Engine: Send + Sync {
    /// Parse and evaluate `code`, returning the value of the last statement.
    fn evaluate(&self, code: &str) -> Result<EngineValue>;

    /// Bind `value` to `name` in the global workspace.
    fn assign(&self, name: &str, value: EngineValue) -> Result<()>;

    /// Fetch a workspace binding, `None` if it does not exist.
    fn get(&self, name: &str) -> Result<Option<EngineValue>>;

    /// Abort the call currently in flight. Callable from any thread.
    fn interrupt(&self);

    /// Take the call slot without blocking.
    fn try_lock(&self) -> Option<EngineLock>;

    /// Take the call slot, waiting at most `timeout` for the current holder.
    fn lock_for(&self, timeout: Duration) -> Option<EngineLock>;

    /// Return a slot taken with [`try_lock`](Engine::try_lock).
    fn unlock(&self, lock: EngineLock);

    /// Console text printed since the last call, if any.
    fn take_output(&self) -> Option<String> {
        None
    }
}

/// Settings an engine is created with.
#[derive(Debug, Clone, Default)]
pub struct EngineSetup {
    /// Engine home directory.
    pub home: Option<PathBuf>,
    /// Directory holding the native bridge library.
    pub bridge_dir: Option<PathBuf>,
}

/// Creates the engine on first use.
pub trait EngineFactory: Send + Sync {
    fn create(&self, setup: &EngineSetup) -> Result<Arc<dyn Engine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineSetup) -> Result<Arc<dyn Engine>> + Send + Sync,
{
    fn create(&self, setup: &EngineSetup) -> Result<Arc<dyn Engine>> {
        self(setup)
    }
}
