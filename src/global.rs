//! Process-wide registry for call sites that have no handle to thread through.
//!
//! The registry is still created explicitly and installed once at startup;
//! [`fail`] only reads what was installed.

use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::engine::Decision;
use crate::registry::Registry;

static INSTALLED: OnceLock<Registry> = OnceLock::new();

/// Install `registry` as the process-wide instance.
///
/// Only the first call has an effect. Returns the installed registry.
pub fn install(registry: Registry) -> &'static Registry {
    let mut fresh = false;
    let installed = INSTALLED.get_or_init(|| {
        fresh = true;
        registry
    });
    if fresh {
        debug!("Installed process-wide failure point registry");
    } else {
        warn!("Failure point registry already installed, keeping existing one");
    }
    installed
}

/// The process-wide registry, if one was installed.
pub fn installed() -> Option<&'static Registry> {
    INSTALLED.get()
}

/// Check `name` against the process-wide registry.
///
/// Never fails when no registry is installed.
pub fn fail(name: &str) -> Decision {
    match INSTALLED.get() {
        Some(registry) => registry.check(name),
        None => Decision::NoFailure,
    }
}

/// Run `$action` when the failure point `$name` fails.
///
/// ```ignore
/// fiu_do_on!("db/commit", panic!("simulated crash"));
/// ```
#[macro_export]
macro_rules! fiu_do_on {
    ($name:expr, $action:expr) => {
        if $crate::fail($name).is_fail() {
            $action;
        }
    };
}

/// Return `$value` from the enclosing function when `$name` fails.
///
/// ```ignore
/// fn read_block() -> std::io::Result<Vec<u8>> {
///     fiu_return_on!("storage/read", Err(std::io::ErrorKind::Other.into()));
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! fiu_return_on {
    ($name:expr, $value:expr) => {
        if $crate::fail($name).is_fail() {
            return $value;
        }
    };
}
