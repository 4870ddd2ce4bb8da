//! Single-consumer FIFO queue of scripts for the engine.
//!
//! Any thread may [`submit`](CommandQueue::submit) a script; exactly one
//! consumer thread runs entries in submission order, one at a time, through
//! a [`ScriptExecutor`]. Failures settle the entry's [`PendingResult`] and
//! never stop the consumer.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::console::Console;
use crate::error::{Error, Result};
use crate::eval::{CancellableEvaluator, CancellationToken};
use crate::value::EngineValue;

/// Runs the scripts the queue hands out.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &str, token: &CancellationToken) -> Result<EngineValue>;

    /// Console text printed by the last script.
    fn take_output(&self) -> Option<String> {
        None
    }
}

impl ScriptExecutor for CancellableEvaluator {
    fn execute(&self, script: &str, token: &CancellationToken) -> Result<EngineValue> {
        self.run(script, token)
    }

    fn take_output(&self) -> Option<String> {
        self.engine().take_output()
    }
}

/// Produces the cancellation token each entry runs under.
pub type MonitorFactory = Box<dyn Fn() -> CancellationToken + Send>;

const DROPPED: &str = "command queue dropped the entry before it ran";

/// Completion handle of a submitted script. Settled exactly once.
#[derive(Debug)]
pub struct PendingResult {
    id: u64,
    rx: Receiver<Result<EngineValue>>,
}

impl PendingResult {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the entry is settled.
    pub fn wait(self) -> Result<EngineValue> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Queue(DROPPED.to_string())))
    }

    /// Block for at most `timeout`; `None` if the entry is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<EngineValue>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::Queue(DROPPED.to_string()))),
        }
    }

    /// Take the result if the entry is settled.
    pub fn try_take(&self) -> Option<Result<EngineValue>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Queue(DROPPED.to_string()))),
        }
    }
}

struct Entry {
    id: u64,
    script: String,
    echo: bool,
    settle: Sender<Result<EngineValue>>,
}

#[derive(Default)]
struct State {
    entries: VecDeque<Entry>,
    next_id: u64,
    running: bool,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    current: Mutex<Option<CancellationToken>>,
    console: Console,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_current(&self, token: Option<CancellationToken>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Next entry, or `None` once a stop was requested.
    fn next(&self) -> Option<Entry> {
        let mut state = self.state();
        loop {
            if state.stop {
                state.running = false;
                return None;
            }
            if let Some(entry) = state.entries.pop_front() {
                return Some(entry);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn consume(&self, executor: &dyn ScriptExecutor, monitors: &MonitorFactory) {
        info!("command queue consumer started");
        while let Some(entry) = self.next() {
            let token = monitors();
            self.set_current(Some(token.clone()));
            self.run_entry(entry, executor, &token);
            self.set_current(None);
        }
        info!("command queue consumer stopped");
    }

    fn run_entry(&self, entry: Entry, executor: &dyn ScriptExecutor, token: &CancellationToken) {
        debug!(id = entry.id, echo = entry.echo, "running queued script");
        if entry.echo {
            self.console.command(entry.script.trim_end());
        }
        if let Some(stale) = executor.take_output() {
            debug!(id = entry.id, bytes = stale.len(), "discarding output printed outside the queue");
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&entry.script, token)))
            .unwrap_or_else(|_| {
                error!(id = entry.id, "script executor panicked");
                Err(Error::Engine("script execution panicked".to_string()))
            });

        let output = executor.take_output();
        if entry.echo
            && let Some(output) = output
        {
            self.console.output(output);
        }

        match &result {
            Ok(_) => debug!(id = entry.id, "queued script finished"),
            Err(e) => {
                warn!(id = entry.id, error = %e, "queued script failed");
                if entry.echo {
                    self.console.error(e.to_string());
                }
            }
        }

        if entry.settle.send(result).is_err() {
            debug!(id = entry.id, "result of queued script was not awaited");
        }
    }
}

/// FIFO command queue with exactly one consumer thread.
pub struct CommandQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("CommandQueue")
            .field("pending", &state.entries.len())
            .field("running", &state.running)
            .finish()
    }
}

impl CommandQueue {
    /// Create a stopped queue that echoes to `console`.
    pub fn new(console: Console) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                available: Condvar::new(),
                current: Mutex::new(None),
                console,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn console(&self) -> &Console {
        &self.shared.console
    }

    /// Enqueue `script`. Never blocks.
    pub fn submit(&self, script: impl Into<String>, echo: bool) -> PendingResult {
        let (settle, rx) = channel::bounded(1);
        let mut state = self.shared.state();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push_back(Entry {
            id,
            script: script.into(),
            echo,
            settle,
        });
        self.shared.available.notify_one();
        debug!(id, pending = state.entries.len(), "script submitted");
        PendingResult { id, rx }
    }

    /// Spawn the consumer thread.
    ///
    /// Each entry runs under a fresh token from `monitors`. Fails with
    /// [`Error::Queue`] while a consumer is already running.
    pub fn start<F>(&self, executor: Arc<dyn ScriptExecutor>, monitors: F) -> Result<()>
    where
        F: Fn() -> CancellationToken + Send + 'static,
    {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.shared.state();
            if state.running {
                return Err(Error::Queue(
                    "command queue consumer is already running".to_string(),
                ));
            }
            state.running = true;
            state.stop = false;
        }
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        let shared = self.shared.clone();
        let monitors: MonitorFactory = Box::new(monitors);
        let spawned = thread::Builder::new()
            .name("rbridge-queue".to_string())
            .spawn(move || shared.consume(executor.as_ref(), &monitors));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.state().running = false;
                Err(e.into())
            }
        }
    }

    /// Make the consumer exit after its current entry.
    ///
    /// Entries not yet started stay queued for the next [`start`](Self::start).
    pub fn stop(&self) {
        {
            let mut state = self.shared.state();
            if !state.running {
                return;
            }
            state.stop = true;
            self.shared.available.notify_all();
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("command queue consumer panicked");
            }
        }
    }

    /// Drop every entry not yet started, settling each with
    /// [`Error::Cancelled`]. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped: Vec<Entry> = self.shared.state().entries.drain(..).collect();
        for entry in &dropped {
            let _ = entry.settle.send(Err(Error::Cancelled));
        }
        if !dropped.is_empty() {
            info!(count = dropped.len(), "cleared queued scripts");
        }
        dropped.len()
    }

    /// Cancel the entry currently running, if any.
    pub fn cancel_current(&self) -> bool {
        let current = self
            .shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Entries waiting to start.
    pub fn len(&self) -> usize {
        self.shared.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, MemoryEngine};
    use crate::eval::CancelPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ScriptExecutor for Recorder {
        fn execute(&self, script: &str, _token: &CancellationToken) -> Result<EngineValue> {
            self.seen.lock().unwrap().push(script.to_string());
            if script == "fail" {
                return Err(Error::Engine("failed on purpose".to_string()));
            }
            Ok(EngineValue::string(script))
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_entries_wait_for_start() {
        let queue = CommandQueue::new(Console::default());
        let pending = queue.submit("a", false);
        assert!(pending.try_take().is_none());
        assert_eq!(queue.len(), 1);

        let exec = recorder();
        queue.start(exec.clone(), CancellationToken::new).unwrap();
        assert_eq!(pending.wait().unwrap(), EngineValue::string("a"));
        queue.stop();
    }

    #[test]
    fn test_failure_does_not_stop_consumer() {
        let queue = CommandQueue::new(Console::default());
        let exec = recorder();
        queue.start(exec.clone(), CancellationToken::new).unwrap();

        let first = queue.submit("fail", true);
        let second = queue.submit("ok", true);
        assert!(matches!(first.wait(), Err(Error::Engine(_))));
        assert_eq!(second.wait().unwrap(), EngineValue::string("ok"));
        assert!(queue.console().text().contains("failed on purpose"));
        queue.stop();
    }

    #[test]
    fn test_second_start_fails() {
        let queue = CommandQueue::new(Console::default());
        queue.start(recorder(), CancellationToken::new).unwrap();
        let err = queue.start(recorder(), CancellationToken::new).unwrap_err();
        assert!(matches!(err, Error::Queue(_)));
        queue.stop();
        assert!(!queue.is_running());
        queue.start(recorder(), CancellationToken::new).unwrap();
    }

    #[test]
    fn test_stop_leaves_entries_queued() {
        let queue = CommandQueue::new(Console::default());
        let exec = recorder();
        queue.start(exec.clone(), CancellationToken::new).unwrap();
        queue.stop();

        let pending = queue.submit("later", false);
        assert!(pending.wait_timeout(Duration::from_millis(50)).is_none());
        queue.start(exec.clone(), CancellationToken::new).unwrap();
        assert!(pending.wait_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }

    #[test]
    fn test_clear_cancels_waiting_entries() {
        let queue = CommandQueue::new(Console::default());
        let a = queue.submit("a", false);
        let b = queue.submit("b", false);
        assert_eq!(queue.clear(), 2);
        assert!(a.wait().unwrap_err().is_cancelled());
        assert!(b.wait().unwrap_err().is_cancelled());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dropped_queue_fails_pending() {
        let queue = CommandQueue::new(Console::default());
        let pending = queue.submit("never", false);
        drop(queue);
        assert!(matches!(pending.wait(), Err(Error::Queue(_))));
    }

    #[test]
    fn test_cancel_current_interrupts_engine() {
        let engine = MemoryEngine::new();
        let eval = CancellableEvaluator::new(
            Arc::new(engine.clone()),
            CancelPolicy::silent().with_interval(Duration::from_millis(10)),
        );
        let queue = CommandQueue::new(Console::default());
        queue.start(Arc::new(eval), CancellationToken::new).unwrap();

        let pending = queue.submit("Sys.sleep(5)", true);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !queue.cancel_current() {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pending.wait().unwrap_err().is_cancelled());
        assert!(queue.console().text().contains("operation cancelled"));
        queue.stop();
    }

    #[test]
    fn test_echo_writes_output() {
        let engine = MemoryEngine::new();
        let eval = CancellableEvaluator::new(Arc::new(engine), CancelPolicy::default());
        let queue = CommandQueue::new(Console::default());
        queue.start(Arc::new(eval), CancellationToken::new).unwrap();

        queue.submit("print(1L)", true).wait().unwrap();
        queue.submit("quiet <- 1", false).wait().unwrap();
        assert_eq!(queue.console().text(), "> print(1L)\n[1] 1\n");
        queue.stop();
    }

    #[test]
    fn test_output_printed_outside_queue_is_not_echoed() {
        let engine = MemoryEngine::new();
        let eval = CancellableEvaluator::new(Arc::new(engine.clone()), CancelPolicy::default());
        let queue = CommandQueue::new(Console::default());
        queue.start(Arc::new(eval), CancellationToken::new).unwrap();

        engine.evaluate("print(\"outside\")").unwrap();
        queue.submit("print(2L)", true).wait().unwrap();
        assert_eq!(queue.console().text(), "> print(2L)\n[1] 2\n");
        queue.stop();
    }

    #[test]
    fn test_monitor_factory_runs_per_entry() {
        let made = Arc::new(AtomicUsize::new(0));
        let queue = CommandQueue::new(Console::default());
        {
            let made = made.clone();
            queue
                .start(recorder(), move || {
                    made.fetch_add(1, Ordering::SeqCst);
                    CancellationToken::new()
                })
                .unwrap();
        }
        queue.submit("a", false).wait().unwrap();
        queue.submit("b", false).wait().unwrap();
        assert_eq!(made.load(Ordering::SeqCst), 2);
        queue.stop();
    }
}
