//! Engine home validation and native bridge discovery.
//!
//! The engine home is the root of an installation tree: it holds a `bin`
//! folder with the engine executable and a `library` folder with installed
//! packages. The native bridge library is looked up in a configured
//! directory, by default `<home>/library/rbridge/libs`.

use std::env;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const HOME_HINT: &str = "The engine home is meant to be the root of the installation tree, \
containing a 'bin' folder with the engine executable and a 'library' folder.";

/// Path of the engine executable below `home`.
pub fn engine_executable(home: &Path) -> PathBuf {
    if cfg!(windows) {
        let arch = if cfg!(target_pointer_width = "64") { "x64" } else { "i386" };
        home.join("bin").join(arch).join("R.exe")
    } else {
        home.join("bin").join("R")
    }
}

/// Validate an engine home, returning a diagnostic when it is unusable.
pub fn check_home(home: &Path) -> Option<String> {
    let shown = home.display();
    if !home.exists() {
        return Some(format!("Engine home '{}' does not exist. {}", shown, HOME_HINT));
    }
    if !home.is_dir() {
        return Some(format!("Engine home '{}' is not a directory. {}", shown, HOME_HINT));
    }
    if !home.join("bin").is_dir() {
        return Some(format!(
            "Engine home '{}' does not contain a folder with name 'bin'. {}",
            shown, HOME_HINT
        ));
    }
    if !engine_executable(home).exists() {
        return Some(format!(
            "Engine home '{}' does not contain an engine executable ({}). {}",
            shown,
            engine_executable(home).display(),
            HOME_HINT
        ));
    }
    if !home.join("library").is_dir() {
        return Some(format!(
            "Engine home '{}' does not contain a folder with name 'library'. {}",
            shown, HOME_HINT
        ));
    }
    None
}

/// Find an engine home from the environment.
///
/// Checks `R_HOME` first, then resolves the `R` executable on `PATH`.
pub fn detect_home() -> Option<PathBuf> {
    if let Ok(path) = env::var("R_HOME") {
        let path = PathBuf::from(path);
        if path.is_dir() {
            debug!(home = %path.display(), "engine home from R_HOME");
            return Some(path);
        }
    }

    let exe = which::which("R").ok()?;
    let exe = exe.canonicalize().unwrap_or(exe);
    // <home>/bin/R
    let home = exe.parent()?.parent()?.to_path_buf();
    debug!(home = %home.display(), "engine home from PATH");
    Some(home)
}

/// Default location of the native bridge below `home`.
pub fn default_bridge_dir(home: &Path) -> PathBuf {
    home.join("library").join("rbridge").join("libs")
}

/// Platform-specific file names the bridge library may have in `dir`.
pub fn bridge_library_candidates(dir: &Path) -> Vec<PathBuf> {
    if cfg!(windows) {
        let arch = if cfg!(target_pointer_width = "64") { "x64" } else { "i386" };
        vec![dir.join(arch).join("rbridge.dll"), dir.join("rbridge.dll")]
    } else if cfg!(target_os = "macos") {
        vec![dir.join("librbridge.dylib"), dir.join("librbridge.jnilib"), dir.join("librbridge.so")]
    } else {
        vec![dir.join("librbridge.so"), dir.join("rbridge.so")]
    }
}

/// Load the first candidate that exists and loads.
///
/// When none does, the error lists every candidate with the reason it was
/// rejected.
pub fn load_bridge_library(candidates: &[PathBuf]) -> Result<(Library, PathBuf)> {
    let mut tried = Vec::with_capacity(candidates.len());

    for path in candidates {
        if !path.exists() {
            tried.push(format!("{} (not found)", path.display()));
            continue;
        }
        // SAFETY: loading runs the library's initializers; the bridge is
        // trusted code shipped with the engine installation.
        match unsafe { Library::new(path) } {
            Ok(library) => {
                debug!(path = %path.display(), "loaded native bridge");
                return Ok((library, path.clone()));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load native bridge");
                tried.push(format!("{} (load error: {})", path.display(), e));
            }
        }
    }

    Err(Error::EngineUnavailable(format!(
        "native bridge library not found at any of {} candidate paths: {}",
        candidates.len(),
        tried.join(", ")
    )))
}
