//! Cancellable evaluation with a watchdog.
//!
//! The engine call runs on a scoped worker thread while the calling thread
//! watches a [`CancellationToken`]. The worker first takes the engine's call
//! slot. When the token fires while the worker is still waiting for the
//! slot, the call is abandoned without touching the engine. When it fires
//! after the worker got in, the watchdog interrupts the engine once, waits
//! for the worker to unwind and reports [`Error::Cancelled`]. A call that
//! finishes before the watchdog notices the token keeps its result.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, info};

use crate::engine::{Engine, EngineLock};
use crate::error::{Error, Result};
use crate::value::EngineValue;

/// Default watchdog interval when cancelling without confirmation.
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Default watchdog interval when cancellation must be confirmed.
pub const DEFAULT_CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle for cooperative cancellation of engine calls.
///
/// Clones share one flag; cancelling any clone is seen by all of them.
///
/// ```
/// use rbridge_core::eval::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear a cancellation request.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// `Err(Error::Cancelled)` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Asked whether a pending cancellation should go ahead.
pub type ConfirmFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// How the watchdog reacts to a cancelled token.
#[derive(Clone)]
pub enum CancelPolicy {
    /// Interrupt as soon as the token is seen cancelled.
    Silent { interval: Duration },
    /// Ask `confirm` first; declining resets the token and the call goes on.
    Confirm { interval: Duration, confirm: ConfirmFn },
}

impl CancelPolicy {
    pub fn silent() -> Self {
        CancelPolicy::Silent {
            interval: DEFAULT_CANCEL_POLL_INTERVAL,
        }
    }

    pub fn confirm<F>(confirm: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        CancelPolicy::Confirm {
            interval: DEFAULT_CONFIRM_POLL_INTERVAL,
            confirm: Arc::new(confirm),
        }
    }

    /// Same policy with another watchdog interval.
    pub fn with_interval(self, interval: Duration) -> Self {
        match self {
            CancelPolicy::Silent { .. } => CancelPolicy::Silent { interval },
            CancelPolicy::Confirm { confirm, .. } => CancelPolicy::Confirm { interval, confirm },
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            CancelPolicy::Silent { interval } | CancelPolicy::Confirm { interval, .. } => *interval,
        }
    }

    fn approves(&self) -> bool {
        match self {
            CancelPolicy::Silent { .. } => true,
            CancelPolicy::Confirm { confirm, .. } => confirm(),
        }
    }
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelPolicy::Silent { interval } => {
                f.debug_struct("Silent").field("interval", interval).finish()
            }
            CancelPolicy::Confirm { interval, .. } => f
                .debug_struct("Confirm")
                .field("interval", interval)
                .finish_non_exhaustive(),
        }
    }
}

/// Lifecycle of one evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    Idle,
    Running,
    Cancelling,
    Done,
}

/// Runs engine calls under a watchdog.
pub struct CancellableEvaluator {
    engine: Arc<dyn Engine>,
    policy: CancelPolicy,
    state: Mutex<EvaluatorState>,
}

impl fmt::Debug for CancellableEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableEvaluator")
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CancellableEvaluator {
    pub fn new(engine: Arc<dyn Engine>, policy: CancelPolicy) -> Self {
        Self {
            engine,
            policy,
            state: Mutex::new(EvaluatorState::Idle),
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn state(&self) -> EvaluatorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EvaluatorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Evaluate `script`, honouring `token`.
    pub fn run(&self, script: &str, token: &CancellationToken) -> Result<EngineValue> {
        self.watch(token, |engine| engine.evaluate(script))
    }

    /// Assign `value` to `name`, honouring `token`.
    pub fn assign(&self, name: &str, value: EngineValue, token: &CancellationToken) -> Result<()> {
        self.watch(token, move |engine| engine.assign(name, value))
    }

    fn watch<T, F>(&self, token: &CancellationToken, op: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&dyn Engine) -> Result<T> + Send,
    {
        token.check()?;
        self.set_state(EvaluatorState::Running);

        let engine: &dyn Engine = &*self.engine;
        let interval = self.policy.interval();
        let phase = Mutex::new(Phase::Waiting);

        let outcome = thread::scope(|scope| -> Result<T> {
            let (tx, rx) = channel::bounded(1);
            let phase = &phase;
            let worker = thread::Builder::new()
                .name("rbridge-eval".to_string())
                .spawn_scoped(scope, move || {
                    let _ = tx.send(enter_and_run(engine, phase, op));
                })?;

            let mut cancelling = false;
            let outcome = loop {
                match rx.recv_timeout(interval) {
                    Ok(result) if cancelling => {
                        debug!(completed = result.is_ok(), "engine call unwound after cancellation");
                        break Err(Error::Cancelled);
                    }
                    Ok(result) => break result,
                    Err(RecvTimeoutError::Timeout) => {
                        if cancelling || !token.is_cancelled() {
                            continue;
                        }
                        if !self.policy.approves() {
                            debug!("cancellation declined, evaluation continues");
                            token.reset();
                            continue;
                        }
                        self.set_state(EvaluatorState::Cancelling);
                        cancelling = true;
                        let mut phase = lock_phase(phase);
                        if *phase == Phase::Waiting {
                            info!("cancelling engine call before it started");
                            *phase = Phase::Abandoned;
                        } else {
                            info!("cancelling engine call");
                            engine.interrupt();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        break Err(Error::Engine(
                            "engine call ended without a result".to_string(),
                        ));
                    }
                }
            };

            if worker.join().is_err() {
                return Err(Error::Engine("engine call panicked".to_string()));
            }
            outcome
        });

        self.set_state(EvaluatorState::Done);
        outcome
    }
}

/// Where the worker stands relative to the engine's call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Entered,
    Abandoned,
}

/// How long the worker waits for the call slot between cancellation checks.
const SLOT_WAIT: Duration = Duration::from_millis(10);

fn lock_phase(phase: &Mutex<Phase>) -> MutexGuard<'_, Phase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call slot held by the worker, returned on drop.
struct HeldSlot<'a> {
    engine: &'a dyn Engine,
    lock: Option<EngineLock>,
}

impl Drop for HeldSlot<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.engine.unlock(lock);
        }
    }
}

/// Take the engine's call slot, then run `op` unless the watchdog abandoned
/// the call first. An interrupt can only reach a call this worker is in.
fn enter_and_run<T>(
    engine: &dyn Engine,
    phase: &Mutex<Phase>,
    op: impl FnOnce(&dyn Engine) -> Result<T>,
) -> Result<T> {
    let lock = loop {
        if *lock_phase(phase) == Phase::Abandoned {
            return Err(Error::Cancelled);
        }
        if let Some(lock) = engine.lock_for(SLOT_WAIT) {
            break lock;
        }
    };
    let _held = HeldSlot {
        engine,
        lock: Some(lock),
    };

    {
        let mut phase = lock_phase(phase);
        if *phase == Phase::Abandoned {
            return Err(Error::Cancelled);
        }
        *phase = Phase::Entered;
    }
    op(engine)
}
