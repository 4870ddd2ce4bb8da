//! Exclusive call slot shared by engine implementations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::warn;

/// Proof of holding an engine's call slot, returned by `Engine::try_lock`.
///
/// Must be handed back through `Engine::unlock`.
#[derive(Debug)]
#[must_use = "an engine lock must be returned through Engine::unlock"]
pub struct EngineLock {
    token: u64,
}

impl EngineLock {
    pub fn token(&self) -> u64 {
        self.token
    }
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    token: u64,
}

/// A single-occupancy slot guarding every call into a non-reentrant engine.
///
/// Holders may be explicit (`try_lock` / `unlock`) or scoped (`enter`).
/// A thread that already holds the slot may enter it again.
///
/// The slot also carries the interrupt request for its current holder. A
/// request made while the slot is free is dropped, and a pending request is
/// cleared when the holder releases the slot.
#[derive(Debug, Default)]
pub struct CallSlot {
    owner: Mutex<Owner>,
    released: Condvar,
    next_token: AtomicU64,
    interrupt: AtomicBool,
}

impl CallSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Owner> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take(&self, owner: &mut Owner) -> u64 {
        let token = self.fresh_token();
        owner.thread = Some(thread::current().id());
        owner.token = token;
        token
    }

    fn release(&self, owner: &mut Owner) {
        owner.thread = None;
        owner.token = 0;
        self.interrupt.store(false, Ordering::SeqCst);
        self.released.notify_all();
    }

    /// Take the slot if nobody holds it.
    pub fn try_lock(&self) -> Option<EngineLock> {
        let mut owner = self.state();
        if owner.thread.is_some() {
            return None;
        }
        Some(EngineLock {
            token: self.take(&mut owner),
        })
    }

    /// Take the slot, waiting at most `timeout` for the holder to leave.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<EngineLock> {
        let owner = self.state();
        let (mut owner, _) = self
            .released
            .wait_timeout_while(owner, timeout, |owner| owner.thread.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        if owner.thread.is_some() {
            return None;
        }
        Some(EngineLock {
            token: self.take(&mut owner),
        })
    }

    /// Release a slot taken with [`try_lock`](Self::try_lock).
    pub fn unlock(&self, lock: EngineLock) {
        let mut owner = self.state();
        if owner.thread.is_none() || owner.token != lock.token {
            warn!(token = lock.token, "ignoring unlock of an engine lock that is not held");
            return;
        }
        self.release(&mut owner);
    }

    /// Whether any thread holds the slot.
    pub fn is_held(&self) -> bool {
        self.state().thread.is_some()
    }

    /// Ask the current holder to stop. `false` if the slot is free.
    pub fn request_interrupt(&self) -> bool {
        let owner = self.state();
        if owner.thread.is_none() {
            return false;
        }
        self.interrupt.store(true, Ordering::SeqCst);
        true
    }

    /// Flag polled by the holder; set by [`request_interrupt`](Self::request_interrupt).
    pub fn interrupt_flag(&self) -> &AtomicBool {
        &self.interrupt
    }

    /// Block until the slot is free (or already held by this thread) and
    /// hold it for the lifetime of the returned guard.
    pub fn enter(&self) -> SlotGuard<'_> {
        let me = thread::current().id();
        let mut owner = self.state();
        loop {
            match owner.thread {
                None => {
                    let token = self.take(&mut owner);
                    return SlotGuard {
                        slot: self,
                        token: Some(token),
                    };
                }
                Some(holder) if holder == me => {
                    return SlotGuard {
                        slot: self,
                        token: None,
                    };
                }
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Scoped occupancy of a [`CallSlot`].
#[derive(Debug)]
pub struct SlotGuard<'a> {
    slot: &'a CallSlot,
    /// `None` for a re-entrant guard that must not release the slot.
    token: Option<u64>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            let mut owner = self.slot.state();
            if owner.token == token {
                self.slot.release(&mut owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_try_lock_is_exclusive() {
        let slot = CallSlot::new();
        let lock = slot.try_lock().unwrap();
        assert!(slot.try_lock().is_none());
        slot.unlock(lock);
        assert!(slot.try_lock().is_some());
    }

    #[test]
    fn test_enter_is_reentrant_for_holder() {
        let slot = CallSlot::new();
        let lock = slot.try_lock().unwrap();
        {
            let _inner = slot.enter();
            assert!(slot.is_held());
        }
        assert!(slot.is_held());
        slot.unlock(lock);
        assert!(!slot.is_held());
    }

    #[test]
    fn test_enter_waits_for_other_holder() {
        let slot = Arc::new(CallSlot::new());
        let lock = slot.try_lock().unwrap();

        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || {
                let _guard = slot.enter();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        slot.unlock(lock);
        waiter.join().unwrap();
        assert!(!slot.is_held());
    }

    #[test]
    fn test_try_lock_for_waits_for_release() {
        let slot = Arc::new(CallSlot::new());
        let lock = slot.try_lock().unwrap();
        assert!(slot.try_lock_for(Duration::from_millis(20)).is_none());

        let releaser = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                slot.unlock(lock);
            })
        };
        let lock = slot.try_lock_for(Duration::from_secs(5)).unwrap();
        releaser.join().unwrap();
        slot.unlock(lock);
    }

    #[test]
    fn test_interrupt_request_lives_with_holder() {
        let slot = CallSlot::new();
        assert!(!slot.request_interrupt());
        assert!(!slot.interrupt_flag().load(Ordering::SeqCst));

        let lock = slot.try_lock().unwrap();
        assert!(slot.request_interrupt());
        assert!(slot.interrupt_flag().load(Ordering::SeqCst));
        slot.unlock(lock);
        assert!(!slot.interrupt_flag().load(Ordering::SeqCst));

        {
            let _guard = slot.enter();
            slot.request_interrupt();
        }
        assert!(!slot.interrupt_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_stale_unlock_ignored() {
        let slot = CallSlot::new();
        let first = slot.try_lock().unwrap();
        let stale = EngineLock {
            token: first.token() + 100,
        };
        slot.unlock(stale);
        assert!(slot.is_held());
        slot.unlock(first);
    }
}
