//! Binding to the native engine bridge.
//!
//! The bridge is a shared library exporting a small byte-oriented C ABI.
//! Values cross the boundary bincode-encoded; buffers returned by the bridge
//! are owned by it and handed back through `rbridge_free`.
//!
//! ```text
//! int  rbridge_start(const u8 *home, size_t home_len, u8 **out, size_t *out_len);
//! int  rbridge_eval(const u8 *code, size_t len, u8 **out, size_t *out_len);
//! int  rbridge_assign(const u8 *name, size_t name_len,
//!                     const u8 *value, size_t value_len, u8 **out, size_t *out_len);
//! int  rbridge_get(const u8 *name, size_t len, u8 **out, size_t *out_len);
//! void rbridge_interrupt(void);
//! void rbridge_free(u8 *ptr, size_t len);
//! ```
//!
//! An embedded engine cannot be torn down and started again, so only one
//! native engine may be started per process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use libc::{c_int, size_t};
use libloading::{Library, Symbol};
use tracing::{debug, info};

use super::{CallSlot, Engine, EngineFactory, EngineLock, EngineSetup};
use crate::error::{Error, Result};
use crate::home;
use crate::value::EngineValue;

/// Status code returned by bridge calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BridgeStatus {
    /// Call succeeded; the output buffer holds the encoded result
    Success = 0,
    /// Requested variable does not exist
    NotFound = 1,
    /// Parse or runtime error; the output buffer holds a UTF-8 message
    EngineError = -1,
    /// The call was aborted by `rbridge_interrupt`
    Interrupted = -2,
    /// The bridge could not decode its input
    DecodeError = -3,
}

impl From<c_int> for BridgeStatus {
    fn from(code: c_int) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::NotFound,
            -2 => Self::Interrupted,
            -3 => Self::DecodeError,
            _ => Self::EngineError,
        }
    }
}

type StartFn = unsafe extern "C" fn(*const u8, size_t, *mut *mut u8, *mut size_t) -> c_int;
type EvalFn = unsafe extern "C" fn(*const u8, size_t, *mut *mut u8, *mut size_t) -> c_int;
type AssignFn =
    unsafe extern "C" fn(*const u8, size_t, *const u8, size_t, *mut *mut u8, *mut size_t) -> c_int;
type GetFn = unsafe extern "C" fn(*const u8, size_t, *mut *mut u8, *mut size_t) -> c_int;
type InterruptFn = unsafe extern "C" fn();
type FreeFn = unsafe extern "C" fn(*mut u8, size_t);

/// Outcome of the one native engine start a process may attempt.
///
/// An embedded engine that failed to start cannot be started again either,
/// so a failure is kept and reported to every later attempt.
#[derive(Debug, Default)]
struct StartOnce {
    claimed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl StartOnce {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Claim the start, or explain why it was already used up.
    fn claim(&self) -> Result<()> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        let failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        Err(Error::EngineUnavailable(match failure.as_deref() {
            Some(reason) => format!(
                "the native engine failed to start earlier in this process: {}",
                reason
            ),
            None => "the native engine was already started in this process".to_string(),
        }))
    }

    fn fail(&self, reason: &str) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }
}

static START: StartOnce = StartOnce::new();

/// RAII guard returning a bridge-allocated buffer to the bridge.
struct BridgeBuffer {
    ptr: *mut u8,
    len: usize,
    free: FreeFn,
}

impl BridgeBuffer {
    /// # Safety
    /// `ptr` must be null or a buffer of `len` bytes allocated by the bridge.
    unsafe fn new(ptr: *mut u8, len: usize, free: FreeFn) -> Self {
        Self { ptr, len, free }
    }

    fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: non-null `ptr` points at `len` bytes owned by the bridge
        // until `free` runs in `drop`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn message(&self) -> String {
        String::from_utf8_lossy(self.as_slice()).into_owned()
    }
}

impl Drop for BridgeBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: the buffer came from the bridge and is freed exactly once.
            unsafe { (self.free)(self.ptr, self.len) }
        }
    }
}

/// Engine backed by the native bridge library.
pub struct NativeEngine {
    eval_fn: EvalFn,
    assign_fn: AssignFn,
    get_fn: GetFn,
    interrupt_fn: InterruptFn,
    free_fn: FreeFn,
    slot: CallSlot,
    path: PathBuf,
    // Keeps the function pointers above valid.
    _library: Library,
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    // SAFETY: the bridge ABI fixes the signature of each exported symbol.
    let sym: Symbol<T> = unsafe { library.get(name.as_bytes()) }?;
    Ok(*sym)
}

impl NativeEngine {
    /// Bind the bridge exports and start the engine.
    ///
    /// Fails with [`Error::EngineUnavailable`] if a native engine was
    /// already started in this process.
    pub fn start(library: Library, path: PathBuf, home: Option<&std::path::Path>) -> Result<Self> {
        let start_fn: StartFn = symbol(&library, "rbridge_start")?;
        let engine = Self {
            eval_fn: symbol(&library, "rbridge_eval")?,
            assign_fn: symbol(&library, "rbridge_assign")?,
            get_fn: symbol(&library, "rbridge_get")?,
            interrupt_fn: symbol(&library, "rbridge_interrupt")?,
            free_fn: symbol(&library, "rbridge_free")?,
            slot: CallSlot::new(),
            path,
            _library: library,
        };

        START.claim()?;

        let home_bytes = home
            .map(|h| h.to_string_lossy().into_owned().into_bytes())
            .unwrap_or_default();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: size_t = 0;
        // SAFETY: the input buffer outlives the call and both out-pointers
        // point at live locals.
        let code = unsafe {
            start_fn(
                home_bytes.as_ptr(),
                home_bytes.len(),
                &mut out_ptr,
                &mut out_len,
            )
        };
        // SAFETY: the bridge filled `out_ptr`/`out_len` with a buffer it owns.
        let out = unsafe { BridgeBuffer::new(out_ptr, out_len, engine.free_fn) };
        match BridgeStatus::from(code) {
            BridgeStatus::Success => {
                info!(path = %engine.path.display(), "native engine started");
                Ok(engine)
            }
            status => {
                let reason = format!("{:?}: {}", status, out.message());
                START.fail(&reason);
                Err(Error::EngineUnavailable(format!(
                    "native engine failed to start ({})",
                    reason
                )))
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<EngineValue> {
        let (value, _): (EngineValue, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(value)
    }

    /// Map a failure status to an error.
    fn failure(status: BridgeStatus, out: &BridgeBuffer) -> Error {
        match status {
            BridgeStatus::Interrupted => Error::Engine("evaluation interrupted".to_string()),
            BridgeStatus::DecodeError => Error::Serialization(out.message()),
            _ => Error::Engine(out.message()),
        }
    }
}

impl Engine for NativeEngine {
    fn evaluate(&self, code: &str) -> Result<EngineValue> {
        let _call = self.slot.enter();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: size_t = 0;
        // SAFETY: `code` outlives the call and the out-pointers point at live
        // locals; the call slot keeps the bridge single-threaded.
        let status = unsafe { (self.eval_fn)(code.as_ptr(), code.len(), &mut out_ptr, &mut out_len) };
        // SAFETY: the bridge filled `out_ptr`/`out_len` with a buffer it owns.
        let out = unsafe { BridgeBuffer::new(out_ptr, out_len, self.free_fn) };
        match BridgeStatus::from(status) {
            BridgeStatus::Success => Self::decode(out.as_slice()),
            status => Err(Self::failure(status, &out)),
        }
    }

    fn assign(&self, name: &str, value: EngineValue) -> Result<()> {
        let bytes = bincode::encode_to_vec(&value, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let _call = self.slot.enter();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: size_t = 0;
        // SAFETY: both input buffers outlive the call and the out-pointers
        // point at live locals; the call slot keeps the bridge single-threaded.
        let status = unsafe {
            (self.assign_fn)(
                name.as_ptr(),
                name.len(),
                bytes.as_ptr(),
                bytes.len(),
                &mut out_ptr,
                &mut out_len,
            )
        };
        // SAFETY: the bridge filled `out_ptr`/`out_len` with a buffer it owns.
        let out = unsafe { BridgeBuffer::new(out_ptr, out_len, self.free_fn) };
        match BridgeStatus::from(status) {
            BridgeStatus::Success => Ok(()),
            status => Err(Self::failure(status, &out)),
        }
    }

    fn get(&self, name: &str) -> Result<Option<EngineValue>> {
        let _call = self.slot.enter();
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: size_t = 0;
        // SAFETY: `name` outlives the call and the out-pointers point at live
        // locals; the call slot keeps the bridge single-threaded.
        let status = unsafe { (self.get_fn)(name.as_ptr(), name.len(), &mut out_ptr, &mut out_len) };
        // SAFETY: the bridge filled `out_ptr`/`out_len` with a buffer it owns.
        let out = unsafe { BridgeBuffer::new(out_ptr, out_len, self.free_fn) };
        match BridgeStatus::from(status) {
            BridgeStatus::Success => Self::decode(out.as_slice()).map(Some),
            BridgeStatus::NotFound => Ok(None),
            status => Err(Self::failure(status, &out)),
        }
    }

    fn interrupt(&self) {
        debug!("interrupting native engine");
        // SAFETY: `rbridge_interrupt` takes no arguments and may be called
        // from any thread.
        unsafe { (self.interrupt_fn)() }
    }

    fn try_lock(&self) -> Option<EngineLock> {
        self.slot.try_lock()
    }

    fn lock_for(&self, timeout: Duration) -> Option<EngineLock> {
        self.slot.try_lock_for(timeout)
    }

    fn unlock(&self, lock: EngineLock) {
        self.slot.unlock(lock);
    }
}

/// Creates a [`NativeEngine`] from the bridge found for the engine setup.
#[derive(Debug, Clone, Default)]
pub struct NativeEngineFactory;

impl NativeEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for NativeEngineFactory {
    fn create(&self, setup: &EngineSetup) -> Result<Arc<dyn Engine>> {
        let dir = match (&setup.bridge_dir, &setup.home) {
            (Some(dir), _) => dir.clone(),
            (None, Some(home)) => home::default_bridge_dir(home),
            (None, None) => {
                return Err(Error::EngineUnavailable(
                    "no engine home or bridge directory configured".to_string(),
                ));
            }
        };
        let candidates = home::bridge_library_candidates(&dir);
        let (library, path) = home::load_bridge_library(&candidates)?;
        let engine = NativeEngine::start(library, path, setup.home.as_deref())?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bridge_status_from_code() {
        assert_eq!(BridgeStatus::from(0), BridgeStatus::Success);
        assert_eq!(BridgeStatus::from(1), BridgeStatus::NotFound);
        assert_eq!(BridgeStatus::from(-1), BridgeStatus::EngineError);
        assert_eq!(BridgeStatus::from(-2), BridgeStatus::Interrupted);
        assert_eq!(BridgeStatus::from(-3), BridgeStatus::DecodeError);
        assert_eq!(BridgeStatus::from(42), BridgeStatus::EngineError);
    }

    #[test]
    fn test_factory_without_bridge_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let setup = EngineSetup {
            home: Some(dir.path().to_path_buf()),
            bridge_dir: None,
        };
        let err = NativeEngineFactory::new().create(&setup).err().unwrap();
        assert!(matches!(err, Error::EngineUnavailable(_)));
        assert!(err.to_string().contains("candidate paths"));
    }

    #[test]
    fn test_failed_start_is_reported_again() {
        let start = StartOnce::new();
        start.claim().unwrap();
        start.fail("EngineError: cannot find R_HOME");

        let err = start.claim().unwrap_err();
        assert!(matches!(err, Error::EngineUnavailable(_)));
        assert!(err.to_string().contains("failed to start earlier"));
        assert!(err.to_string().contains("cannot find R_HOME"));
    }

    #[test]
    fn test_second_start_is_refused() {
        let start = StartOnce::new();
        start.claim().unwrap();
        let err = start.claim().unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[test]
    fn test_factory_needs_a_location() {
        let err = NativeEngineFactory::new()
            .create(&EngineSetup::default())
            .err().unwrap();
        assert!(matches!(err, Error::EngineUnavailable(_)));
    }
}
