//! Configuration for the control channel.
//!
//! Loaded from an optional YAML file and `FIU__*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[cfg(unix)]
use crate::control::{default_base_prefix, ControlTarget};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fiu.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FIU_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FIU";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FIU_LOG";
/// Enables the control channel with the given base prefix.
pub const CTRL_FIFO_ENV_VAR: &str = "FIU_CTRL_FIFO";

/// Default controller-side reply timeout.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 5;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote control channel.
    pub control: ControlConfig,
}

/// Remote control channel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Whether a target process exposes its pipe pair.
    pub enabled: bool,
    /// Base prefix; the pid is appended as `<base>-<pid>`.
    pub base_prefix: PathBuf,
    /// Explicit prefix, used instead of `<base>-<pid>` when set.
    pub path: Option<PathBuf>,
    /// How long a controller waits for each reply. `0` waits forever.
    pub reply_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_prefix: base_prefix_default(),
            path: None,
            reply_timeout_secs: DEFAULT_REPLY_TIMEOUT_SECS,
        }
    }
}

#[cfg(unix)]
fn base_prefix_default() -> PathBuf {
    default_base_prefix()
}

#[cfg(not(unix))]
fn base_prefix_default() -> PathBuf {
    std::env::temp_dir().join("fiu-ctrl")
}

impl ControlConfig {
    /// Reply timeout, or `None` to wait forever.
    pub fn reply_timeout(&self) -> Option<Duration> {
        match self.reply_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Pipe pair this process exposes.
    #[cfg(unix)]
    pub fn target(&self) -> ControlTarget {
        match &self.path {
            Some(path) => ControlTarget::path(path),
            None => ControlTarget::current_process(&self.base_prefix),
        }
    }

    /// Honor `FIU_CTRL_FIFO`: enable the channel under that base prefix.
    fn apply_ctrl_fifo_env(&mut self) {
        if let Some(base) = std::env::var_os(CTRL_FIFO_ENV_VAR).filter(|v| !v.is_empty()) {
            self.enabled = true;
            self.base_prefix = PathBuf::from(base);
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `fiu.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `CTRL_FIFO_ENV_VAR`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.control.apply_ctrl_fifo_env();
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
