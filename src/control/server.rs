//! Control server - the per-process thread that owns the pipe pair.
//!
//! Each controller connection is served by the same [`Session`]. When the
//! controller closes its end the thread reopens both pipes and waits for the
//! next one, so a target accepts any number of sequential controllers.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::libc;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::{debug, error, info, warn};

use super::{ControlError, ControlPipes, ControlTarget, Result, Session};
use crate::config::ControlConfig;
use crate::registry::Registry;

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);
const SHUTDOWN_ATTEMPTS: u32 = 100;

/// Handle to a running control thread. Stops the thread and removes the pipes
/// when dropped.
pub struct ControlServer {
    pipes: Option<ControlPipes>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Create the pipes for `target` and start serving commands against
    /// `registry`.
    pub fn start(registry: Registry, target: ControlTarget) -> Result<Self> {
        let pipes = ControlPipes::create(&target)?;
        let stop = Arc::new(AtomicBool::new(false));

        let in_path = pipes.in_path().to_path_buf();
        let out_path = pipes.out_path().to_path_buf();
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("fiu-control".to_string())
            .spawn(move || serve_forever(registry, in_path, out_path, thread_stop))
            .map_err(|e| ControlError::io(pipes.prefix(), e))?;

        info!(prefix = %pipes.prefix().display(), "Control server started");

        Ok(Self {
            pipes: Some(pipes),
            stop,
            handle: Some(handle),
        })
    }

    /// Start the server described by `config`, or return `None` when the
    /// control channel is disabled.
    pub fn start_from_config(registry: Registry, config: &ControlConfig) -> Result<Option<Self>> {
        if !config.enabled {
            debug!("Control channel disabled");
            return Ok(None);
        }
        Self::start(registry, config.target()).map(Some)
    }

    /// Prefix of the exposed pipe pair.
    pub fn prefix(&self) -> Option<&Path> {
        self.pipes.as_ref().map(|p| p.prefix())
    }

    /// Stop the thread and remove the pipes.
    pub fn shutdown(mut self) {
        self.stop_and_cleanup();
    }

    fn stop_and_cleanup(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);

        if let Some(pipes) = self.pipes.as_ref() {
            for _ in 0..SHUTDOWN_ATTEMPTS {
                if handle.is_finished() {
                    break;
                }
                wake(pipes.in_path(), pipes.out_path());
                thread::sleep(SHUTDOWN_POLL);
            }
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                error!("Control thread panicked");
            }
        } else {
            warn!("Control thread busy with a controller, detaching it");
        }

        // Dropping the pipes removes the FIFOs
        self.pipes.take();
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop_and_cleanup();
    }
}

/// Unblock a thread waiting in `open` on either pipe.
fn wake(in_path: &Path, out_path: &Path) {
    let _ = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(in_path);
    let _ = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(out_path);
}

/// Turn `SIGPIPE` on this thread into `EPIPE`, so a controller that leaves
/// early cannot terminate the host process.
fn block_sigpipe() {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGPIPE);
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) {
        warn!(error = %e, "Failed to block SIGPIPE on control thread");
    }
}

fn serve_forever(registry: Registry, in_path: PathBuf, out_path: PathBuf, stop: Arc<AtomicBool>) {
    block_sigpipe();
    let mut session = Session::new(registry);
    let stopped = || stop.load(Ordering::Acquire);

    // Outer loop: one iteration per controller connection
    while !stopped() {
        // Blocks until a controller opens the inbound pipe for writing
        let reader = match File::open(&in_path) {
            Ok(f) => f,
            Err(e) => {
                error!(pipe = %in_path.display(), error = %e, "Failed to open control pipe");
                break;
            }
        };
        if stopped() {
            break;
        }

        // Blocks until the controller opens the outbound pipe for reading
        let writer = match OpenOptions::new().write(true).open(&out_path) {
            Ok(f) => f,
            Err(e) => {
                error!(pipe = %out_path.display(), error = %e, "Failed to open control pipe");
                break;
            }
        };
        if stopped() {
            break;
        }

        debug!(pipe = %in_path.display(), "Controller connected");

        match session.serve(BufReader::new(reader), writer) {
            Ok(count) => debug!(commands = count, "Controller disconnected"),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!("Controller went away before reading its reply");
            }
            Err(e) => warn!(error = %e, "Control session I/O error"),
        }
    }

    debug!(handled = session.handled(), "Control thread exiting");
}
