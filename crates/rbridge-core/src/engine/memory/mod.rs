//! In-process engine interpreting a subset of the engine language.
//!
//! `MemoryEngine` understands assignments, calls, `for` loops, `if`/`else`,
//! arithmetic and comparisons, plus the builtins needed to manage a
//! workspace: vector and data-frame construction, `ls`/`rm`/`exists`,
//! package attach/detach, `save.image`/`load` and `Sys.sleep`. Hosts can add
//! functions with [`MemoryEngine::register_function`].
//!
//! Interrupts are observed before every statement, on each loop iteration
//! and every few milliseconds inside `Sys.sleep`. Statements that completed
//! before the interrupt keep their effects.

mod builtins;
mod interp;
mod parser;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, error};

pub use interp::HostFunction;
use interp::{Interp, Workspace};

use super::{CallSlot, Engine, EngineFactory, EngineLock, EngineSetup};
use crate::error::{Error, Result};
use crate::value::EngineValue;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[derive(Default)]
struct Inner {
    workspace: Mutex<Workspace>,
    functions: RwLock<FxHashMap<String, HostFunction>>,
    slot: CallSlot,
    busy: AtomicBool,
    interrupts: AtomicUsize,
}

/// A cloneable handle to one in-memory engine instance.
///
/// Clones share the same workspace, so a test can keep a handle to the
/// engine it gave to a controller.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("busy", &self.inner.busy.load(Ordering::Relaxed))
            .field("interrupts", &self.interrupt_count())
            .finish_non_exhaustive()
    }
}

/// Marks the engine busy for the duration of one top-level call.
struct BusyGuard<'a> {
    inner: &'a Inner,
}

impl<'a> BusyGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.busy.store(true, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::SeqCst);
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` callable from engine code.
    pub fn register_function<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&[EngineValue]) -> Result<EngineValue> + Send + Sync + 'static,
    {
        let mut functions = self
            .inner
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        functions.insert(name.into(), Arc::new(function));
    }

    /// Make `name` available to `library()` without attaching it.
    pub fn install_package(&self, name: impl Into<String>) {
        self.workspace().installed.insert(name.into());
    }

    /// Packages currently attached, most recent first.
    pub fn attached_packages(&self) -> Vec<String> {
        self.workspace().attached.clone()
    }

    /// Names bound in the global workspace, sorted.
    pub fn variable_names(&self) -> Vec<String> {
        self.workspace().vars.keys().cloned().collect()
    }

    /// Memory limit set through `memory.limit(size = ..)`.
    pub fn memory_limit(&self) -> Option<f64> {
        self.workspace().memory_limit
    }

    /// How many times [`Engine::interrupt`] has been called.
    pub fn interrupt_count(&self) -> usize {
        self.inner.interrupts.load(Ordering::SeqCst)
    }

    fn workspace(&self) -> MutexGuard<'_, Workspace> {
        self.inner
            .workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for MemoryEngine {
    fn evaluate(&self, code: &str) -> Result<EngineValue> {
        let stmts = parser::parse(code)?;
        let _call = self.inner.slot.enter();
        let _busy = BusyGuard::enter(&self.inner);

        let mut workspace = self.workspace();
        let functions = self
            .inner
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut interp = Interp {
            ws: &mut *workspace,
            functions: &*functions,
            interrupt: self.inner.slot.interrupt_flag(),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| interp.run(&stmts)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(panic = message, "memory engine evaluation panicked");
                Err(Error::Engine(format!("evaluation failed: {}", message)))
            });
        debug!(ok = result.is_ok(), statements = stmts.len(), "memory engine evaluated");
        result
    }

    fn assign(&self, name: &str, value: EngineValue) -> Result<()> {
        let _call = self.inner.slot.enter();
        self.workspace().vars.insert(name.to_string(), value);
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<EngineValue>> {
        let _call = self.inner.slot.enter();
        Ok(self.workspace().vars.get(name).cloned())
    }

    fn interrupt(&self) {
        self.inner.interrupts.fetch_add(1, Ordering::SeqCst);
        let pending = self.inner.slot.request_interrupt();
        debug!(pending, "memory engine interrupt requested");
    }

    fn try_lock(&self) -> Option<EngineLock> {
        self.inner.slot.try_lock()
    }

    fn lock_for(&self, timeout: Duration) -> Option<EngineLock> {
        self.inner.slot.try_lock_for(timeout)
    }

    fn unlock(&self, lock: EngineLock) {
        self.inner.slot.unlock(lock);
    }

    fn take_output(&self) -> Option<String> {
        let mut workspace = self.workspace();
        if workspace.output.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut workspace.output))
        }
    }
}

impl EngineFactory for MemoryEngine {
    fn create(&self, setup: &EngineSetup) -> Result<Arc<dyn Engine>> {
        debug!(home = ?setup.home, "starting memory engine");
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_evaluate_and_get() {
        let engine = MemoryEngine::new();
        engine.evaluate("x <- c(1, 2, 3)").unwrap();
        assert_eq!(
            engine.get("x").unwrap(),
            Some(EngineValue::Double(vec![1.0, 2.0, 3.0]))
        );
        assert_eq!(engine.get("y").unwrap(), None);
    }

    #[test]
    fn test_assign_then_evaluate() {
        let engine = MemoryEngine::new();
        engine.assign("n", EngineValue::Integer(vec![4])).unwrap();
        assert_eq!(
            engine.evaluate("n + 1L").unwrap(),
            EngineValue::Integer(vec![5])
        );
    }

    #[test]
    fn test_host_function() {
        let engine = MemoryEngine::new();
        engine.register_function("twice", |args: &[EngineValue]| match args.first() {
            Some(EngineValue::Double(v)) => Ok(EngineValue::Double(v.iter().map(|x| x * 2.0).collect())),
            _ => Err(Error::Engine("twice() needs a number".to_string())),
        });
        assert_eq!(
            engine.evaluate("twice(21)").unwrap(),
            EngineValue::Double(vec![42.0])
        );
        assert!(engine.evaluate("twice(\"a\")").is_err());
    }

    #[test]
    fn test_interrupt_stops_sleep_and_keeps_prior_effects() {
        let engine = MemoryEngine::new();
        let worker = {
            let engine = engine.clone();
            thread::spawn(move || engine.evaluate("before <- 1; Sys.sleep(5); after <- 2"))
        };

        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        engine.interrupt();
        let result = worker.join().unwrap();

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.interrupt_count(), 1);
        assert_eq!(engine.variable_names(), vec!["before".to_string()]);
    }

    #[test]
    fn test_failed_call_leaves_engine_usable() {
        let engine = MemoryEngine::new();
        engine.register_function("explode", |_: &[EngineValue]| -> Result<EngineValue> {
            panic!("host function failure")
        });

        let err = engine.evaluate("x <- 1:Inf").unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        let err = engine.evaluate("explode()").unwrap_err();
        assert!(err.to_string().contains("host function failure"));

        engine.evaluate("y <- 1L").unwrap();
        engine.assign("z", EngineValue::Integer(vec![2])).unwrap();
        assert_eq!(engine.get("y").unwrap(), Some(EngineValue::Integer(vec![1])));
        assert_eq!(engine.variable_names(), vec!["y".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_interrupt_while_slot_held_reaches_next_call() {
        let engine = MemoryEngine::new();
        let lock = engine.try_lock().unwrap();
        engine.interrupt();
        assert!(engine.evaluate("x <- 1").is_err());
        engine.unlock(lock);
        assert!(engine.evaluate("x <- 1").is_ok());
    }

    #[test]
    fn test_idle_interrupt_does_not_poison_next_call() {
        let engine = MemoryEngine::new();
        engine.interrupt();
        assert!(engine.evaluate("x <- 1").is_ok());
    }

    #[test]
    fn test_print_output_is_taken_once() {
        let engine = MemoryEngine::new();
        engine.evaluate("print(\"hi\")").unwrap();
        assert_eq!(engine.take_output().as_deref(), Some("[1] \"hi\"\n"));
        assert_eq!(engine.take_output(), None);
    }

    #[test]
    fn test_try_lock_blocks_other_callers() {
        let engine = MemoryEngine::new();
        let lock = engine.try_lock().unwrap();
        assert!(engine.try_lock().is_none());
        // The holder may still call in.
        engine.evaluate("x <- 1").unwrap();
        engine.unlock(lock);
        assert!(engine.try_lock().is_some());
    }
}
