//! Discovery of processes that expose control pipes under a base prefix.

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use super::{ControlError, ControlPipes, ControlTarget, Result, IN_SUFFIX};

/// A controllable process found by [`list_targets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedTarget {
    pub pid: u32,
    pub prefix: PathBuf,
}

/// Whether a process with this pid exists.
///
/// A process owned by another user still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Live processes with a complete pipe pair at `<base>-<pid>`, sorted by pid.
pub fn list_targets(base: &Path) -> Result<Vec<ListedTarget>> {
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let Some(stem) = base.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let lead = format!("{}-", stem);

    let entries = fs::read_dir(dir).map_err(|e| ControlError::io(dir, e))?;
    let mut found: Vec<ListedTarget> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let pid = name
                .to_str()?
                .strip_prefix(lead.as_str())?
                .strip_suffix(IN_SUFFIX)?
                .parse::<u32>()
                .ok()?;
            let target = ControlTarget::pid_with_base(base, pid);
            (process_alive(pid) && ControlPipes::exist(&target)).then(|| ListedTarget {
                pid,
                prefix: target.prefix(),
            })
        })
        .collect();

    found.sort_by_key(|t| t.pid);
    Ok(found)
}
