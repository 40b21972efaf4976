//! Remote control over a pair of named pipes.
//!
//! A target process exposes `P.in` (commands) and `P.out` (replies) for some
//! prefix `P`:
//!
//! ```text
//! ┌──────────────┐  P.in   ┌──────────────────────────────┐
//! │  controller  │────────▶│ ControlServer thread         │
//! │  (fiu-ctrl)  │◀────────│   Session ──▶ Registry       │
//! └──────────────┘  P.out  └──────────────────────────────┘
//! ```
//!
//! The prefix is either `<base>-<pid>` (base defaults to
//! `${TMPDIR:-/tmp}/fiu-ctrl`) or an explicit path.

mod client;
mod listing;
mod pipes;
mod server;
mod session;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use client::{ControlClient, ControlConnection};
pub use listing::{list_targets, process_alive, ListedTarget};
pub use pipes::ControlPipes;
pub use server::ControlServer;
pub use session::{Session, SessionState};

/// File name of the default base prefix inside the temp directory.
pub const DEFAULT_PREFIX_NAME: &str = "fiu-ctrl";
/// Suffix of the inbound (command) pipe.
pub const IN_SUFFIX: &str = ".in";
/// Suffix of the outbound (reply) pipe.
pub const OUT_SUFFIX: &str = ".out";

pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors on the control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create FIFO {path}: {source}")]
    Fifo {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("No control pipes at {0}")]
    PipesNotFound(PathBuf),

    #[error("Process {0} is not running")]
    ProcessNotRunning(u32),

    #[error("Nothing is listening on {0}")]
    NotListening(PathBuf),

    #[error("Timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    #[error("Control channel closed before a reply was received")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl ControlError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ControlError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Base prefix used when none is configured: `${TMPDIR:-/tmp}/fiu-ctrl`.
pub fn default_base_prefix() -> PathBuf {
    let tmp = std::env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    tmp.join(DEFAULT_PREFIX_NAME)
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(prefix.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Which pipe pair a controller talks to, or a server exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlTarget {
    /// `<base>-<pid>`.
    Pid { base: PathBuf, pid: u32 },
    /// An explicit prefix.
    Path(PathBuf),
}

impl ControlTarget {
    /// Target a process under the default base prefix.
    pub fn pid(pid: u32) -> Self {
        Self::pid_with_base(default_base_prefix(), pid)
    }

    pub fn pid_with_base(base: impl Into<PathBuf>, pid: u32) -> Self {
        ControlTarget::Pid {
            base: base.into(),
            pid,
        }
    }

    pub fn path(prefix: impl Into<PathBuf>) -> Self {
        ControlTarget::Path(prefix.into())
    }

    /// The current process under `base`.
    pub fn current_process(base: impl Into<PathBuf>) -> Self {
        Self::pid_with_base(base, std::process::id())
    }

    /// Prefix `P` shared by both pipes.
    pub fn prefix(&self) -> PathBuf {
        match self {
            ControlTarget::Pid { base, pid } => with_suffix(base, &format!("-{}", pid)),
            ControlTarget::Path(prefix) => prefix.clone(),
        }
    }

    /// `P.in`
    pub fn in_path(&self) -> PathBuf {
        with_suffix(&self.prefix(), IN_SUFFIX)
    }

    /// `P.out`
    pub fn out_path(&self) -> PathBuf {
        with_suffix(&self.prefix(), OUT_SUFFIX)
    }
}

impl std::fmt::Display for ControlTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlTarget::Pid { pid, .. } => write!(f, "pid {}", pid),
            ControlTarget::Path(prefix) => write!(f, "{}", prefix.display()),
        }
    }
}
