//! Configuration types for the test utilities.
//!
//! Split into the lock config (how concurrent tests are serialized) and the
//! local-mode config (where locally-hosted endpoints listen). Both have
//! defaults that match the container's local mode and can be overlaid from
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Overrides the lock file path.
pub const ENV_LOCK_PATH: &str = "TRAINKIT_LOCK_PATH";
/// Overrides the post-release delay, in milliseconds.
pub const ENV_LOCK_RELEASE_DELAY_MS: &str = "TRAINKIT_LOCK_RELEASE_DELAY_MS";
/// Overrides the local-mode host.
pub const ENV_LOCAL_MODE_HOST: &str = "TRAINKIT_LOCAL_MODE_HOST";
/// Overrides the local-mode port.
pub const ENV_LOCAL_MODE_PORT: &str = "TRAINKIT_LOCAL_MODE_PORT";

/// Port every locally-hosted serving container binds.
pub const DEFAULT_LOCAL_MODE_PORT: u16 = 8080;

/// Delay between the end of a protected section and the lock release.
pub const DEFAULT_RELEASE_DELAY: Duration = Duration::from_secs(5);

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value {value:?} for {var}: {reason}")]
pub struct ConfigError {
    /// Variable name.
    pub var: String,
    /// Raw value.
    pub value: String,
    /// What is wrong with it.
    pub reason: String,
}

/// Settings for the local-mode serialization lock.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LockConfig {
    /// Lock file. Created (with parent directories) on first use.
    pub path: PathBuf,
    /// How long the holder keeps the lock after its protected section ends.
    ///
    /// Gives the locally-hosted server time to release the port before the
    /// next holder starts its own. The 5 second default is a heuristic: no
    /// readiness signal is observed.
    pub release_delay: Duration,
}

impl LockConfig {
    /// Lock config with an explicit path and delay.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, release_delay: Duration) -> Self {
        Self {
            path: path.into(),
            release_delay,
        }
    }

    /// Default lock file: `tests/resources/local_mode_lock` under this crate.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("resources")
            .join("local_mode_lock")
    }

    /// Defaults overlaid with the `TRAINKIT_LOCK_*` values from `lookup`.
    ///
    /// # Errors
    /// Returns an error if the delay variable is not an integer.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_LOCK_PATH).filter(|p| !p.is_empty()) {
            config.path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_LOCK_RELEASE_DELAY_MS) {
            let millis = raw.trim().parse::<u64>().map_err(|e| ConfigError {
                var: ENV_LOCK_RELEASE_DELAY_MS.to_owned(),
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            config.release_delay = Duration::from_millis(millis);
        }
        Ok(config)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            release_delay: DEFAULT_RELEASE_DELAY,
        }
    }
}

/// Where locally-hosted endpoints listen.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LocalModeConfig {
    /// Bind host (default: `127.0.0.1`).
    pub host: String,
    /// Bind port (default: 8080). Every local endpoint uses the same port,
    /// which is why local-mode tests must hold the lock.
    pub port: u16,
}

impl LocalModeConfig {
    /// Defaults overlaid with the `TRAINKIT_LOCAL_MODE_*` values from `lookup`.
    ///
    /// # Errors
    /// Returns an error if the port variable is not a valid port number.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup(ENV_LOCAL_MODE_HOST).filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(raw) = lookup(ENV_LOCAL_MODE_PORT) {
            config.port = raw.trim().parse::<u16>().map_err(|e| ConfigError {
                var: ENV_LOCAL_MODE_PORT.to_owned(),
                value: raw.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(config)
    }

    /// Base URL of the local endpoint.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for LocalModeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_LOCAL_MODE_PORT,
        }
    }
}

/// All test-utility settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct TestkitConfig {
    /// Serialization lock.
    pub lock: LockConfig,
    /// Locally-hosted endpoints.
    pub local_mode: LocalModeConfig,
}

impl TestkitConfig {
    /// Defaults overlaid with every `TRAINKIT_*` environment variable.
    ///
    /// # Errors
    /// Returns the first invalid variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with every `TRAINKIT_*` value from `lookup`.
    ///
    /// # Errors
    /// Returns the first invalid variable, lock settings first.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            lock: LockConfig::from_lookup(&lookup)?,
            local_mode: LocalModeConfig::from_lookup(&lookup)?,
        })
    }
}
