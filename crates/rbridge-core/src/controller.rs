//! The engine controller.
//!
//! [`EngineController`] owns the one engine of the process. The engine is
//! created on first access and lives until the process exits: once an
//! engine has been live, a changed engine home or a failed re-validation
//! makes the controller report that a restart is required rather than
//! building a second engine.
//!
//! Calls through the controller are not serialized against each other.
//! Scripts go through the [`CommandQueue`] or the caller holds an
//! [`AccessGuard`] for the whole sequence, e.g. an export followed by an
//! import. Cancelled calls may leave the workspace partially modified; the
//! engine offers no rollback.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::{ValueCodec, decode_variables, encode_variables};
use crate::config::{ControllerConfig, SharedHome};
use crate::console::Console;
use crate::engine::{Engine, EngineFactory, EngineSetup};
use crate::error::{Error, Result};
use crate::eval::{CancelPolicy, CancellableEvaluator, CancellationToken};
use crate::frame::{ScalarVariable, TabularFrame};
use crate::home;
use crate::notify::{ListenerId, Listeners, Notifier, WorkspaceListener, WorkspaceWatch};
use crate::queue::{CommandQueue, ScriptExecutor};
use crate::scripts::{self, LOADED_LIBRARIES_VARIABLE, TEMP_VARIABLE};
use crate::value::{DATA_FRAME_CLASS, EngineValue, LOGICAL_TRUE};

/// Diagnostic reported once an engine was live and can no longer be used.
pub const RESTART_REQUIRED: &str = "The engine home changed after the engine was started. \
An embedded engine cannot be restarted within a running process; restart the application \
to use the new setting.";

/// Whether the engine can be used, with the diagnostics of the last
/// (re)initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Availability {
    fn failed(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            available: false,
            errors,
            warnings,
        }
    }

    fn unavailable_error(&self) -> Error {
        if self.errors.is_empty() {
            Error::EngineUnavailable("the engine is not initialized".to_string())
        } else {
            Error::EngineUnavailable(self.errors.join("\n"))
        }
    }
}

#[derive(Default)]
struct EngineState {
    engine: Option<Arc<dyn Engine>>,
    availability: Availability,
    was_available: bool,
    /// Home setting the live engine was created with.
    initialized_home: Option<PathBuf>,
    notifier: Option<Notifier>,
}

#[derive(Debug, Default)]
struct Semaphore {
    held: Mutex<bool>,
    released: Condvar,
}

impl Semaphore {
    fn permit(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) {
        let held = self.permit();
        let mut held = self
            .released
            .wait_while(held, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
        *held = true;
    }

    fn try_acquire(&self) -> bool {
        let mut held = self.permit();
        if *held {
            return false;
        }
        *held = true;
        true
    }

    fn try_acquire_for(&self, timeout: Duration) -> bool {
        let held = self.permit();
        let (mut held, _) = self
            .released
            .wait_timeout_while(held, timeout, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
        if *held {
            return false;
        }
        *held = true;
        true
    }

    fn release(&self) {
        *self.permit() = false;
        self.released.notify_one();
    }
}

struct Shared {
    config: ControllerConfig,
    home: SharedHome,
    factory: Box<dyn EngineFactory>,
    codec: ValueCodec,
    policy: RwLock<CancelPolicy>,
    state: Mutex<EngineState>,
    access: Semaphore,
    watch: Arc<WorkspaceWatch>,
    listeners: Arc<Listeners>,
    console: Console,
}

/// Exclusive use of the engine outside the command queue.
///
/// Released on drop.
#[must_use = "access is released as soon as the guard is dropped"]
pub struct AccessGuard {
    shared: Arc<Shared>,
}

impl AccessGuard {
    pub fn release(self) {}
}

impl fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGuard").finish_non_exhaustive()
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.shared.access.release();
    }
}

fn is_true(value: &EngineValue) -> bool {
    matches!(value, EngineValue::Logical(v) if v.first() == Some(&LOGICAL_TRUE))
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> CancelPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-validate, then hand out the live engine.
    fn engine(&self) -> Result<Arc<dyn Engine>> {
        let mut state = self.state();
        self.revalidate(&mut state);
        match &state.engine {
            Some(engine) if state.availability.available => Ok(engine.clone()),
            _ => Err(state.availability.unavailable_error()),
        }
    }

    fn availability(&self) -> Availability {
        let mut state = self.state();
        self.revalidate(&mut state);
        state.availability.clone()
    }

    fn revalidate(&self, state: &mut EngineState) {
        let home = self.home.get();
        if state.availability.available {
            if state.initialized_home == home {
                return;
            }
            warn!(
                from = ?state.initialized_home,
                to = ?home,
                "engine home changed while the engine is running"
            );
        }
        if state.was_available {
            if state.availability.errors.iter().all(|e| e != RESTART_REQUIRED) {
                error!("engine needs a process restart");
            }
            state.availability = Availability::failed(vec![RESTART_REQUIRED.to_string()], Vec::new());
            return;
        }
        self.initialize(state, home);
    }

    fn initialize(&self, state: &mut EngineState, configured: Option<PathBuf>) {
        let mut warnings = Vec::new();
        let fail = |state: &mut EngineState, message: String, warnings: Vec<String>| {
            error!(%message, "engine initialization failed");
            state.availability = Availability::failed(vec![message], warnings);
        };

        let home = match configured.clone().or_else(home::detect_home) {
            Some(home) => home,
            None => {
                return fail(
                    state,
                    "No engine home is configured and none was found through R_HOME or PATH."
                        .to_string(),
                    warnings,
                );
            }
        };
        if configured.is_none() {
            warnings.push(format!("Using detected engine home '{}'.", home.display()));
        }
        if let Some(problem) = home::check_home(&home) {
            return fail(state, problem, warnings);
        }

        let setup = EngineSetup {
            home: Some(home.clone()),
            bridge_dir: self.config.bridge_dir.clone(),
        };
        let engine = match self.factory.create(&setup) {
            Ok(engine) => engine,
            Err(e) => return fail(state, e.to_string(), warnings),
        };

        if let Some(megabytes) = self.config.memory_limit
            && let Err(e) = engine.evaluate(&scripts::memory_limit(megabytes))
        {
            warn!(megabytes, error = %e, "could not set engine memory limit");
            warnings.push(format!(
                "Could not set the engine memory limit to {} MB: {}",
                megabytes, e
            ));
        }

        match Notifier::spawn(
            self.watch.clone(),
            self.listeners.clone(),
            self.config.workspace_poll_interval(),
        ) {
            Ok(notifier) => state.notifier = Some(notifier),
            Err(e) => {
                warn!(error = %e, "could not start workspace notifier");
                warnings.push(format!("Workspace change notifications are disabled: {}", e));
            }
        }

        info!(home = %home.display(), "engine initialized");
        state.engine = Some(engine);
        state.was_available = true;
        state.initialized_home = configured;
        state.availability = Availability {
            available: true,
            errors: Vec::new(),
            warnings,
        };
    }

    fn evaluator(&self) -> Result<CancellableEvaluator> {
        Ok(CancellableEvaluator::new(self.engine()?, self.policy()))
    }

    fn monitored_eval(&self, code: &str, token: &CancellationToken) -> Result<EngineValue> {
        let evaluator = self.evaluator()?;
        debug!(code, "monitored evaluation");
        let result = evaluator.run(code, token);
        self.watch.bump();
        result
    }

    fn monitored_assign(
        &self,
        name: &str,
        value: EngineValue,
        token: &CancellationToken,
    ) -> Result<()> {
        scripts::check_symbol(name)?;
        let evaluator = self.evaluator()?;
        debug!(name, kind = ?value.kind(), "monitored assignment");
        let result = evaluator.assign(name, value, token);
        self.watch.bump();
        result
    }

    /// Assign under the temp name, then rename, so `name` never holds a
    /// partially assigned value.
    fn assign_via_temp(
        &self,
        name: &str,
        value: EngineValue,
        token: &CancellationToken,
    ) -> Result<()> {
        self.monitored_assign(TEMP_VARIABLE, value, token)?;
        self.monitored_eval(&scripts::rename(TEMP_VARIABLE, name), token)?;
        Ok(())
    }

    fn exists(&self, name: &str, token: &CancellationToken) -> Result<bool> {
        self.monitored_eval(&scripts::exists(name), token)
            .map(|v| is_true(&v))
    }

    fn fetch(&self, name: &str) -> Result<EngineValue> {
        self.engine()?
            .get(name)?
            .ok_or_else(|| Error::Engine(format!("object '{}' not found", name)))
    }
}

impl ScriptExecutor for Shared {
    fn execute(&self, script: &str, token: &CancellationToken) -> Result<EngineValue> {
        self.monitored_eval(script, token)
    }

    fn take_output(&self) -> Option<String> {
        let engine = self.state().engine.clone()?;
        engine.take_output()
    }
}

/// Facade over the process's single engine.
pub struct EngineController {
    // Dropped first so the consumer releases the shared state.
    queue: CommandQueue,
    shared: Arc<Shared>,
}

impl fmt::Debug for EngineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineController")
            .field("queue", &self.queue)
            .field("home", &self.shared.home.get())
            .finish_non_exhaustive()
    }
}

impl EngineController {
    /// Create the controller and start its command queue.
    ///
    /// The engine itself is created by `factory` on first access.
    pub fn new<F>(config: ControllerConfig, factory: F) -> Result<Arc<Self>>
    where
        F: EngineFactory + 'static,
    {
        let home = SharedHome::new(config.home.clone());
        Self::with_shared_home(config, home, factory)
    }

    /// Like [`new`](Self::new), reading the engine home from `home`.
    pub fn with_shared_home<F>(
        config: ControllerConfig,
        home: SharedHome,
        factory: F,
    ) -> Result<Arc<Self>>
    where
        F: EngineFactory + 'static,
    {
        let console = Console::new(config.console_capacity);
        let shared = Arc::new(Shared {
            codec: config.codec(),
            policy: RwLock::new(config.cancel_policy()),
            home,
            factory: Box::new(factory),
            state: Mutex::new(EngineState::default()),
            access: Semaphore::default(),
            watch: Arc::new(WorkspaceWatch::new()),
            listeners: Arc::new(Listeners::new()),
            console: console.clone(),
            config,
        });
        let controller = Self {
            queue: CommandQueue::new(console),
            shared,
        };
        controller.start_queue()?;
        Ok(Arc::new(controller))
    }

    /// Start the command queue consumer after a [`CommandQueue::stop`].
    pub fn start_queue(&self) -> Result<()> {
        self.queue
            .start(self.shared.clone(), CancellationToken::new)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// The live engine-home setting.
    pub fn home(&self) -> &SharedHome {
        &self.shared.home
    }

    pub fn codec(&self) -> ValueCodec {
        self.shared.codec
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn console(&self) -> &Console {
        &self.shared.console
    }

    /// Policy used by every cancellable call.
    pub fn set_cancel_policy(&self, policy: CancelPolicy) {
        *self
            .shared
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn cancel_policy(&self) -> CancelPolicy {
        self.shared.policy()
    }

    /// Re-validate and report whether the engine can be used.
    pub fn availability(&self) -> Availability {
        self.shared.availability()
    }

    pub fn is_available(&self) -> bool {
        self.availability().available
    }

    /// Block until exclusive access is granted.
    pub fn acquire(&self) -> Result<AccessGuard> {
        self.shared.engine()?;
        self.shared.access.acquire();
        Ok(self.guard())
    }

    /// Exclusive access if it is free right now and the engine is available.
    pub fn try_acquire(&self) -> Option<AccessGuard> {
        self.shared.engine().ok()?;
        self.shared.access.try_acquire().then(|| self.guard())
    }

    /// Exclusive access if granted within `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<AccessGuard> {
        self.shared.engine().ok()?;
        self.shared
            .access
            .try_acquire_for(timeout)
            .then(|| self.guard())
    }

    fn guard(&self) -> AccessGuard {
        AccessGuard {
            shared: self.shared.clone(),
        }
    }

    /// Evaluate `code` directly, without cancellation.
    pub fn eval(&self, code: &str) -> Result<EngineValue> {
        let engine = self.shared.engine()?;
        debug!(code, "direct evaluation");
        let result = engine.evaluate(code);
        self.shared.watch.bump();
        result
    }

    /// Evaluate `code` only if no other call is in the engine.
    ///
    /// `Ok(None)` means the engine was busy and nothing ran.
    pub fn idle_eval(&self, code: &str) -> Result<Option<EngineValue>> {
        let engine = self.shared.engine()?;
        let Some(lock) = engine.try_lock() else {
            debug!(code, "engine busy, skipping idle evaluation");
            return Ok(None);
        };
        let result = engine.evaluate(code);
        engine.unlock(lock);
        self.shared.watch.bump();
        result.map(Some)
    }

    /// Evaluate `code`, interrupting the engine when `token` is cancelled.
    pub fn monitored_eval(&self, code: &str, token: &CancellationToken) -> Result<EngineValue> {
        self.shared.monitored_eval(code, token)
    }

    /// Assign `value` to `name`, interrupting the engine when `token` is
    /// cancelled.
    pub fn monitored_assign(
        &self,
        name: &str,
        value: EngineValue,
        token: &CancellationToken,
    ) -> Result<()> {
        self.shared.monitored_assign(name, value, token)
    }

    /// Bind `frame` to `name` in the workspace.
    ///
    /// The frame is assigned to a reserved temporary name first and then
    /// renamed.
    pub fn export_table(
        &self,
        frame: &TabularFrame,
        name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        scripts::check_symbol(name)?;
        if frame.column_count() == 0 {
            self.shared
                .monitored_eval(&scripts::empty_frame(name), token)?;
            return Ok(());
        }
        let value = self.shared.codec.encode(frame)?;
        debug!(
            name,
            rows = frame.row_count(),
            columns = frame.column_count(),
            "exporting table"
        );
        self.shared.assign_via_temp(name, value, token)
    }

    /// Read the data frame bound to `name`.
    ///
    /// A missing variable yields an empty frame; any other class fails with
    /// [`Error::UnsupportedShape`].
    pub fn import_table(
        &self,
        name: &str,
        non_numbers_as_missing: bool,
        token: &CancellationToken,
    ) -> Result<TabularFrame> {
        scripts::check_symbol(name)?;
        if !self.shared.exists(name, token)? {
            debug!(name, "import of a missing variable");
            return Ok(TabularFrame::empty());
        }

        let class = self
            .shared
            .monitored_eval(&scripts::class_of(name), token)?;
        let classes: Vec<String> = class.as_strings().into_iter().flatten().collect();
        if !classes.iter().any(|c| c == DATA_FRAME_CLASS) {
            return Err(Error::UnsupportedShape(format!(
                "'{}' is of class {}, only data.frame can be imported",
                name,
                classes.join("/")
            )));
        }

        token.check()?;
        let value = self.shared.fetch(name)?;
        self.shared.codec.decode(&value, non_numbers_as_missing)
    }

    /// Bind `variables` to `name` as a named list.
    pub fn export_variables(
        &self,
        variables: &[ScalarVariable],
        name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        scripts::check_symbol(name)?;
        self.shared
            .assign_via_temp(name, encode_variables(variables), token)
    }

    /// Read the named list bound to `name` as variables. A missing variable
    /// yields no variables.
    pub fn import_variables(&self, name: &str) -> Result<Vec<ScalarVariable>> {
        scripts::check_symbol(name)?;
        match self.shared.engine()?.get(name)? {
            Some(value) => decode_variables(&value),
            None => Ok(Vec::new()),
        }
    }

    /// Detach non-default libraries and remove every binding.
    pub fn clear_workspace(&self, token: &CancellationToken) -> Result<()> {
        info!("clearing workspace");
        self.shared
            .monitored_eval(scripts::CLEAR_WORKSPACE, token)?;
        Ok(())
    }

    /// Write the workspace image to `path`, recording the attached libraries
    /// in it.
    pub fn save_workspace(&self, path: &Path, token: &CancellationToken) -> Result<()> {
        info!(path = %path.display(), "saving workspace");
        self.shared
            .monitored_eval(&scripts::save_workspace(path), token)?;
        Ok(())
    }

    /// Replace the workspace with the image at `path`.
    ///
    /// Returns the libraries recorded when the image was saved. They are not
    /// attached; see [`load_libraries`](Self::load_libraries).
    pub fn load_workspace(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>> {
        self.clear_workspace(token)?;
        info!(path = %path.display(), "loading workspace");
        self.shared
            .monitored_eval(&scripts::load_workspace(path), token)?;
        self.import_loaded_libraries()
    }

    /// Read and remove the loaded-libraries marker.
    pub fn import_loaded_libraries(&self) -> Result<Vec<String>> {
        let engine = self.shared.engine()?;
        let libraries = match engine.get(LOADED_LIBRARIES_VARIABLE)? {
            Some(value) => {
                engine.evaluate(&scripts::remove(LOADED_LIBRARIES_VARIABLE))?;
                self.shared.watch.bump();
                value.as_strings().into_iter().flatten().collect()
            }
            None => Vec::new(),
        };
        Ok(libraries)
    }

    /// Attach each of `libraries` that is not attached yet.
    pub fn load_libraries(&self, libraries: &[String]) -> Result<()> {
        if libraries.is_empty() {
            return Ok(());
        }
        debug!(?libraries, "loading libraries");
        self.eval(&scripts::load_libraries(libraries))?;
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn WorkspaceListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Number of engine calls made through this controller.
    pub fn workspace_generation(&self) -> u64 {
        self.shared.watch.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::fs;
    use tempfile::TempDir;

    fn fake_home() -> TempDir {
        let dir = TempDir::new().unwrap();
        let exe = home::engine_executable(dir.path());
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(&exe, "").unwrap();
        fs::create_dir_all(dir.path().join("library")).unwrap();
        dir
    }

    #[test]
    fn test_engine_created_lazily() {
        let home = fake_home();
        let created = Arc::new(Mutex::new(0));
        let factory = {
            let created = created.clone();
            move |_: &EngineSetup| -> Result<Arc<dyn Engine>> {
                *created.lock().unwrap() += 1;
                Ok(Arc::new(MemoryEngine::new()))
            }
        };
        let controller =
            EngineController::new(ControllerConfig::with_home(home.path()), factory).unwrap();
        assert_eq!(*created.lock().unwrap(), 0);
        assert!(controller.is_available());
        assert!(controller.is_available());
        assert_eq!(*created.lock().unwrap(), 1);
    }

    #[test]
    fn test_invalid_home_is_reported() {
        let dir = TempDir::new().unwrap();
        let controller = EngineController::new(
            ControllerConfig::with_home(dir.path().join("missing")),
            MemoryEngine::new(),
        )
        .unwrap();
        let availability = controller.availability();
        assert!(!availability.available);
        assert!(availability.errors[0].contains("does not exist"));
        assert!(matches!(controller.eval("1"), Err(Error::EngineUnavailable(_))));
        assert!(controller.try_acquire().is_none());
    }

    #[test]
    fn test_memory_limit_failure_is_a_warning() {
        let home = fake_home();
        let config = ControllerConfig {
            memory_limit: Some(0),
            ..ControllerConfig::with_home(home.path())
        };
        let controller = EngineController::new(config, MemoryEngine::new()).unwrap();
        let availability = controller.availability();
        assert!(availability.available);
        assert_eq!(availability.warnings.len(), 1);
        assert!(availability.warnings[0].contains("0 MB"));
    }

    #[test]
    fn test_idle_eval_skips_busy_engine() {
        let home = fake_home();
        let engine = MemoryEngine::new();
        let controller =
            EngineController::new(ControllerConfig::with_home(home.path()), engine.clone())
                .unwrap();
        assert!(controller.is_available());

        let lock = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.try_lock().map(|l| l.token()))
                .join()
                .unwrap()
        };
        assert!(lock.is_some());
        assert_eq!(controller.idle_eval("1L").unwrap(), None);
    }

    #[test]
    fn test_invalid_symbol_rejected_before_engine_call() {
        let home = fake_home();
        let engine = MemoryEngine::new();
        let controller =
            EngineController::new(ControllerConfig::with_home(home.path()), engine.clone())
                .unwrap();
        let token = CancellationToken::new();
        let err = controller
            .export_table(&TabularFrame::empty(), "x; rm(y)", &token)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSymbol(_)));
        assert!(engine.variable_names().is_empty());
    }
}
