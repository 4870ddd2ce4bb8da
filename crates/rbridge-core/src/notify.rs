//! Workspace change notification.
//!
//! Every engine call the controller makes bumps a [`WorkspaceWatch`]. A
//! notifier thread waits on the watch and tells each registered
//! [`WorkspaceListener`] about the newest generation. Bursts of changes are
//! coalesced into one event.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

/// Sent to listeners after the workspace may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceEvent {
    /// Number of engine calls observed so far.
    pub generation: u64,
}

/// Observer of workspace changes. Closures taking `&WorkspaceEvent`
/// implement it.
pub trait WorkspaceListener: Send + Sync {
    fn workspace_changed(&self, event: &WorkspaceEvent);
}

impl<F> WorkspaceListener for F
where
    F: Fn(&WorkspaceEvent) + Send + Sync,
{
    fn workspace_changed(&self, event: &WorkspaceEvent) {
        self(event)
    }
}

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct WatchState {
    generation: u64,
    closed: bool,
}

/// Outcome of [`WorkspaceWatch::wait_for_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchWait {
    Changed(u64),
    TimedOut,
    Closed,
}

/// Generation counter of workspace changes.
#[derive(Debug, Default)]
pub struct WorkspaceWatch {
    state: Mutex<WatchState>,
    changed: Condvar,
}

impl WorkspaceWatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a change and wake waiters. Returns the new generation.
    pub fn bump(&self) -> u64 {
        let mut state = self.state();
        state.generation += 1;
        self.changed.notify_all();
        state.generation
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Wait until the generation moves past `seen`, the watch is closed or
    /// `timeout` elapses.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> WatchWait {
        let state = self.state();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.closed && s.generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            WatchWait::Closed
        } else if state.generation != seen {
            WatchWait::Changed(state.generation)
        } else {
            WatchWait::TimedOut
        }
    }

    /// Release every waiter for good.
    pub fn close(&self) {
        self.state().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Registered listeners.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<dyn WorkspaceListener>)>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn WorkspaceListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregister `id`; `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener. A panicking listener is logged and skipped.
    pub fn notify(&self, event: &WorkspaceEvent) {
        let listeners: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (id, listener) in listeners {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.workspace_changed(event)));
            if outcome.is_err() {
                warn!(listener = ?id, generation = event.generation, "workspace listener panicked");
            }
        }
    }
}

/// Thread delivering workspace events until its watch is closed.
#[derive(Debug)]
pub struct Notifier {
    watch: Arc<WorkspaceWatch>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    pub fn spawn(
        watch: Arc<WorkspaceWatch>,
        listeners: Arc<Listeners>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let thread_watch = watch.clone();
        let seen = watch.generation();
        let handle = thread::Builder::new()
            .name("rbridge-workspace".to_string())
            .spawn(move || run(&thread_watch, &listeners, seen, poll_interval))?;
        Ok(Self {
            watch,
            handle: Some(handle),
        })
    }
}

fn run(watch: &WorkspaceWatch, listeners: &Listeners, mut seen: u64, poll_interval: Duration) {
    debug!("workspace notifier started");
    loop {
        match watch.wait_for_change(seen, poll_interval) {
            WatchWait::Closed => break,
            WatchWait::TimedOut => continue,
            WatchWait::Changed(generation) => {
                seen = generation;
                listeners.notify(&WorkspaceEvent { generation });
            }
        }
    }
    debug!("workspace notifier stopped");
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.watch.close();
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}
