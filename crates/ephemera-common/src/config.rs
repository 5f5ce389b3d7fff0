//! Settings read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EphemeraError, EphemeraResult};

/// Disable the reaper entirely.
pub const ENV_REAPER_DISABLED: &str = "EPHEMERA_REAPER_DISABLED";
/// Turn on debug logging for the harness.
pub const ENV_VERBOSE: &str = "EPHEMERA_VERBOSE";
/// Reaper endpoint.
pub const ENV_REAPER_ADDR: &str = "EPHEMERA_REAPER_ADDR";
/// Timeout for connecting and registering with the reaper.
pub const ENV_REAPER_CONNECTION_TIMEOUT: &str = "EPHEMERA_REAPER_CONNECTION_TIMEOUT";
/// Grace period the reaper waits for a dropped session to reconnect.
pub const ENV_REAPER_RECONNECTION_TIMEOUT: &str = "EPHEMERA_REAPER_RECONNECTION_TIMEOUT";
/// Reaper executable launched when no reaper is listening.
pub const ENV_REAPER_BINARY: &str = "EPHEMERA_REAPER_BINARY";
/// Custom runtime socket.
pub const ENV_RUNTIME_SOCKET: &str = "EPHEMERA_RUNTIME_SOCKET";
/// Private registry prefix for image names.
pub const ENV_IMAGE_PREFIX: &str = "EPHEMERA_IMAGE_PREFIX";

/// Default reaper endpoint.
pub const DEFAULT_REAPER_ADDR: &str = "127.0.0.1:8770";
/// Default reaper executable, looked up on `PATH`.
pub const DEFAULT_REAPER_BINARY: &str = "ephemera-reaper";

/// Harness settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Skip the reaper connection and reaper labels.
    pub reaper_disabled: bool,
    /// Verbose logging.
    pub verbose: bool,
    /// Where the reaper listens.
    pub reaper_addr: SocketAddr,
    /// Connect and handshake timeout for the reaper.
    pub reaper_connection_timeout: Duration,
    /// Grace period the reaper gives this session after its connection
    /// drops. `None` leaves it to the reaper's own setting.
    pub reaper_reconnection_timeout: Option<Duration>,
    /// Reaper executable to launch when none is listening.
    pub reaper_binary: PathBuf,
    /// Runtime socket override.
    pub runtime_socket: Option<PathBuf>,
    /// Registry prefix for images that name no registry.
    pub image_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reaper_disabled: false,
            verbose: false,
            reaper_addr: SocketAddr::from(([127, 0, 0, 1], 8770)),
            reaper_connection_timeout: Duration::from_secs(60),
            reaper_reconnection_timeout: None,
            reaper_binary: PathBuf::from(DEFAULT_REAPER_BINARY),
            runtime_socket: None,
            image_prefix: None,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Config`] if a variable holds an invalid value.
    pub fn from_env() -> EphemeraResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read settings from key/value pairs. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Config`] if a variable holds an invalid value.
    pub fn from_vars<I, K, V>(vars: I) -> EphemeraResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_REAPER_DISABLED => settings.reaper_disabled = parse_bool(ENV_REAPER_DISABLED, value)?,
                ENV_VERBOSE => settings.verbose = parse_bool(ENV_VERBOSE, value)?,
                ENV_REAPER_ADDR => {
                    settings.reaper_addr = value.parse().map_err(|_| invalid(ENV_REAPER_ADDR, value))?;
                }
                ENV_REAPER_CONNECTION_TIMEOUT => {
                    settings.reaper_connection_timeout =
                        parse_duration(value).ok_or_else(|| invalid(ENV_REAPER_CONNECTION_TIMEOUT, value))?;
                }
                ENV_REAPER_RECONNECTION_TIMEOUT => {
                    settings.reaper_reconnection_timeout = Some(
                        parse_duration(value)
                            .ok_or_else(|| invalid(ENV_REAPER_RECONNECTION_TIMEOUT, value))?,
                    );
                }
                ENV_REAPER_BINARY if !value.is_empty() => {
                    settings.reaper_binary = PathBuf::from(value);
                }
                ENV_RUNTIME_SOCKET if !value.is_empty() => {
                    let path = value.strip_prefix("unix://").unwrap_or(value);
                    settings.runtime_socket = Some(PathBuf::from(path));
                }
                ENV_IMAGE_PREFIX if !value.is_empty() => {
                    settings.image_prefix = Some(value.trim_end_matches('/').to_string());
                }
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Disable or enable the reaper.
    #[must_use]
    pub const fn with_reaper_disabled(mut self, disabled: bool) -> Self {
        self.reaper_disabled = disabled;
        self
    }

    /// Set the reaper endpoint.
    #[must_use]
    pub const fn with_reaper_addr(mut self, addr: SocketAddr) -> Self {
        self.reaper_addr = addr;
        self
    }

    /// Set the reaper executable.
    #[must_use]
    pub fn with_reaper_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.reaper_binary = path.into();
        self
    }

    /// Ask the reaper for a specific reconnection grace period.
    #[must_use]
    pub const fn with_reaper_reconnection_timeout(mut self, grace: Duration) -> Self {
        self.reaper_reconnection_timeout = Some(grace);
        self
    }

    /// Set the registry prefix.
    #[must_use]
    pub fn with_image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = Some(prefix.into());
        self
    }

    /// Apply the registry prefix to an image reference.
    ///
    /// Images whose first path segment is a registry host (contains `.` or
    /// `:`, or is `localhost`) are left alone.
    #[must_use]
    pub fn resolve_image(&self, image: &str) -> String {
        let Some(prefix) = &self.image_prefix else {
            return image.to_string();
        };
        if let Some((first, _)) = image.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                return image.to_string();
            }
        }
        format!("{prefix}/{image}")
    }
}

fn invalid(key: &str, value: &str) -> EphemeraError {
    EphemeraError::Config {
        message: format!("{key}: invalid value {value:?}"),
    }
}

fn parse_bool(key: &str, value: &str) -> EphemeraResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// Parse `30`, `30s`, `500ms` or `2m`.
#[must_use]
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(m) = value.strip_suffix('m') {
        return m
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
    }
    value
        .strip_suffix('s')
        .unwrap_or(value)
        .parse()
        .ok()
        .map(Duration::from_secs)
}
