//! Controller for an embedded statistics engine.
//!
//! The engine is single-threaded and non-reentrant; the host is not. This
//! crate provides:
//! - A table model ([`TabularFrame`]) and the engine's value model ([`EngineValue`])
//! - Conversion between the two ([`ValueCodec`])
//! - A FIFO command queue with a single consumer ([`CommandQueue`])
//! - Cancellable evaluation that interrupts the engine ([`CancellableEvaluator`])
//! - The [`EngineController`] facade: lazy engine start, exclusive access,
//!   table and variable transfer, workspace save / load
//!
//! Engines plug in through the [`Engine`] trait. [`MemoryEngine`] interprets a
//! subset of the engine language in-process; [`NativeEngine`] binds the native
//! bridge library.

pub mod codec;
pub mod config;
pub mod console;
pub mod controller;
pub mod engine;
pub mod error;
pub mod eval;
pub mod frame;
pub mod home;
pub mod notify;
pub mod queue;
pub mod scripts;
pub mod value;

pub use codec::{StringEncoding, ValueCodec};
pub use config::{ControllerConfig, SharedHome};
pub use console::{Console, ConsoleLine, LineKind};
pub use controller::{AccessGuard, Availability, EngineController, RESTART_REQUIRED};
pub use engine::{
    Engine, EngineFactory, EngineLock, EngineSetup, MemoryEngine, NativeEngine,
    NativeEngineFactory,
};
pub use error::{Error, Result};
pub use eval::{CancelPolicy, CancellableEvaluator, CancellationToken, EvaluatorState};
pub use frame::{
    Cell, ColumnSpec, ColumnType, FrameBuilder, ScalarValue, ScalarVariable, TabularFrame,
};
pub use notify::{ListenerId, WorkspaceEvent, WorkspaceListener};
pub use queue::{CommandQueue, PendingResult, ScriptExecutor};
pub use value::{EngineValue, ListEntry, ValueKind};
