//! fiu - fault injection in userspace.
//!
//! A program names its points of failure and asks, at each one, whether it
//! should fail right now. Tests decide the answer by enabling rules in a
//! [`Registry`], either in-process or from another process over a pair of
//! named pipes (see [`control`]).
//!
//! ```ignore
//! let registry = fiu::install(fiu::Registry::new());
//! registry.register(fiu::FailurePoint::random("posix/io/*", 0.1).unwrap());
//!
//! if let fiu::Decision::Fail { code, .. } = fiu::fail("posix/io/read") {
//!     return Err(std::io::Error::from_raw_os_error(code as i32));
//! }
//! ```

pub mod config;
#[cfg(unix)]
pub mod control;
pub mod engine;
pub mod global;
pub mod matcher;
pub mod point;
pub mod protocol;
pub mod registry;
pub mod utils;

pub use engine::Decision;
pub use global::{fail, install, installed};
pub use point::{FailInfo, FailurePoint, Mode, PatternKind};
pub use registry::Registry;

/// Install a fresh process-wide registry and start the control channel if
/// `config` enables it.
///
/// Returns the server handle; dropping it removes the pipes.
#[cfg(unix)]
pub fn init(config: &config::Config) -> control::Result<Option<control::ControlServer>> {
    let registry = install(Registry::new());
    control::ControlServer::start_from_config(registry.clone(), &config.control)
}

/// [`init`] with configuration loaded from `fiu.yaml`, `FIU_CONFIG`, `FIU__*`
/// and `FIU_CTRL_FIFO`.
#[cfg(unix)]
pub fn init_from_env() -> control::Result<Option<control::ControlServer>> {
    let config = config::Config::load(None)?;
    init(&config)
}
