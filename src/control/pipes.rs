//! Creation and cleanup of the control FIFO pair.
//!
//! Pipes are removed when [`ControlPipes`] is dropped, and by an `atexit` hook
//! for processes that end through `std::process::exit` without unwinding.
//! Termination by a signal or by `panic = "abort"` still leaves them behind;
//! the next process to use the same prefix replaces them.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, PoisonError, TryLockError};

use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info, warn};

use super::{ControlError, ControlTarget, Result};

/// FIFOs created by this process and not yet removed.
static LIVE_PIPES: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static EXIT_HOOK: Once = Once::new();

extern "C" fn remove_live_pipes() {
    let mut live = match LIVE_PIPES.try_lock() {
        Ok(live) => live,
        Err(TryLockError::Poisoned(e)) => e.into_inner(),
        // Exiting while another thread holds the list
        Err(TryLockError::WouldBlock) => return,
    };
    for path in live.drain(..) {
        let _ = fs::remove_file(path);
    }
}

fn track(paths: [&Path; 2]) {
    LIVE_PIPES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(paths.iter().map(|p| p.to_path_buf()));

    EXIT_HOOK.call_once(|| {
        // SAFETY: the hook is a plain extern "C" fn that never unwinds.
        if unsafe { libc::atexit(remove_live_pipes) } != 0 {
            warn!("Failed to register control pipe cleanup at exit");
        }
    });
}

fn untrack(paths: [&Path; 2]) {
    LIVE_PIPES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|p| !paths.contains(&p.as_path()));
}

/// The `P.in` / `P.out` FIFOs of one target. Removed on drop.
#[derive(Debug)]
pub struct ControlPipes {
    prefix: PathBuf,
    in_path: PathBuf,
    out_path: PathBuf,
}

impl ControlPipes {
    /// Create both FIFOs, replacing stale files left by an earlier process.
    pub fn create(target: &ControlTarget) -> Result<Self> {
        let pipes = Self {
            prefix: target.prefix(),
            in_path: target.in_path(),
            out_path: target.out_path(),
        };

        if let Some(parent) = pipes.prefix.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ControlError::io(parent, e))?;
            }
        }

        for path in [&pipes.in_path, &pipes.out_path] {
            if fs::symlink_metadata(path).is_ok() {
                debug!(path = %path.display(), "Removing stale control pipe");
                fs::remove_file(path).map_err(|e| ControlError::io(path, e))?;
            }
            mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(|source| {
                ControlError::Fifo {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        track([pipes.in_path.as_path(), pipes.out_path.as_path()]);
        info!(prefix = %pipes.prefix.display(), "Created control pipes");
        Ok(pipes)
    }

    /// Whether both FIFOs of `target` exist.
    pub fn exist(target: &ControlTarget) -> bool {
        is_fifo(&target.in_path()) && is_fifo(&target.out_path())
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn in_path(&self) -> &Path {
        &self.in_path
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    fn cleanup(&self) {
        untrack([self.in_path.as_path(), self.out_path.as_path()]);
        for path in [&self.in_path, &self.out_path] {
            if fs::symlink_metadata(path).is_ok() {
                let _ = fs::remove_file(path);
            }
        }
        info!(prefix = %self.prefix.display(), "Removed control pipes");
    }
}

impl Drop for ControlPipes {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn is_fifo(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}
