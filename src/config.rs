//! Configuration loading.
//!
//! Settings come from an optional TOML file and are overridden by CLI flags.
//! The file lives at:
//!
//! 1. `$XDG_CONFIG_HOME/icsd-downloader/config.toml`
//! 2. `$HOME/.config/icsd-downloader/config.toml`
//!
//! or at an explicit `--config` path. A missing default file means defaults.
//! Credentials never come from the file; see [`credential_from_env`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::Credential;
use crate::batch::MAX_BATCH_SIZE;
use crate::client::{
    ClientOptions, CONNECT_TIMEOUT_SECS, DEFAULT_BASE_URL, READ_TIMEOUT_SECS, SEARCH_TIMEOUT_SECS,
};
use crate::engine::DEFAULT_CONCURRENCY;
use crate::session::{DEFAULT_AUTH_ATTEMPTS, DEFAULT_AUTH_BACKOFF, RetryPolicy};

/// Directory name under the user config root.
const APP_DIR: &str = "icsd-downloader";

/// Environment variable holding the login id.
pub const LOGIN_ID_ENV: &str = "ICSD_LOGIN_ID";

/// Environment variable holding the password.
pub const PASSWORD_ENV: &str = "ICSD_PASSWORD";

/// Default folder for merged artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {path}")]
    NotFound {
        /// The requested path.
        path: PathBuf,
    },

    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// The config file.
        path: PathBuf,
        /// The parser error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    Invalid {
        /// Key name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },

    /// A credential part is missing from the environment.
    #[error("missing credential: set {var}")]
    MissingCredential {
        /// The variable to set.
        var: &'static str,
    },
}

/// Raw file contents; every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Service root URL.
    pub base_url: Option<String>,
    /// Worker pool size (1..=100).
    pub concurrency: Option<usize>,
    /// Ids per remote call (1..=500).
    pub batch_size: Option<usize>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout for data calls in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Per-request timeout for searches in seconds.
    pub search_timeout_secs: Option<u64>,
    /// Ask the service for CRLF line endings.
    pub windows_client: Option<bool>,
    /// Login attempts before giving up (1..=20).
    pub auth_attempts: Option<u32>,
    /// Pause between login attempts in milliseconds.
    pub auth_backoff_ms: Option<u64>,
    /// Folder for merged artifacts.
    pub output_dir: Option<PathBuf>,
}

/// Resolved settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Service root, e.g. `https://icsd.fiz-karlsruhe.de/ws`.
    pub base_url: String,
    /// Maximum number of batches in flight at once.
    pub concurrency: usize,
    /// Maximum ids sent in one remote call.
    pub batch_size: usize,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout for login, logout and data calls in seconds.
    pub read_timeout_secs: u64,
    /// Whole-request timeout for searches in seconds.
    pub search_timeout_secs: u64,
    /// Request CRLF line endings from the service.
    pub windows_client: bool,
    /// Login attempts per token before giving up.
    pub auth_attempts: u32,
    /// Pause between login attempts in milliseconds.
    pub auth_backoff_ms: u64,
    /// Folder that receives merged artifacts and failure lists.
    pub output_dir: PathBuf,
}

impl Default for Settings {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: MAX_BATCH_SIZE,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            search_timeout_secs: SEARCH_TIMEOUT_SECS,
            windows_client: false,
            auth_attempts: DEFAULT_AUTH_ATTEMPTS,
            auth_backoff_ms: DEFAULT_AUTH_BACKOFF.as_millis() as u64,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

/// Settings plus where they came from.
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    /// Config path that was consulted, if one could be resolved.
    pub path: Option<PathBuf>,
    /// Whether a file was actually read.
    pub loaded_from_file: bool,
    /// The resolved settings.
    pub settings: Settings,
}

impl Settings {
    /// Applies file values over the defaults and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_file_config(file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            base_url: file.base_url.unwrap_or(defaults.base_url),
            concurrency: file.concurrency.unwrap_or(defaults.concurrency),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            connect_timeout_secs: file
                .connect_timeout_secs
                .unwrap_or(defaults.connect_timeout_secs),
            read_timeout_secs: file.read_timeout_secs.unwrap_or(defaults.read_timeout_secs),
            search_timeout_secs: file
                .search_timeout_secs
                .unwrap_or(defaults.search_timeout_secs),
            windows_client: file.windows_client.unwrap_or(defaults.windows_client),
            auth_attempts: file.auth_attempts.unwrap_or(defaults.auth_attempts),
            auth_backoff_ms: file.auth_backoff_ms.unwrap_or(defaults.auth_backoff_ms),
            output_dir: file.output_dir.unwrap_or(defaults.output_dir),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from `explicit` or, when `None`, the default location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit file is missing, or a file
    /// cannot be read, parsed or validated.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedSettings, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            return Ok(LoadedSettings {
                path: Some(path.to_path_buf()),
                loaded_from_file: true,
                settings: Self::from_file_config(read_file_config(path)?)?,
            });
        }

        let path = resolve_default_config_path();
        match path.as_deref() {
            Some(existing) if existing.exists() => {
                let settings = Self::from_file_config(read_file_config(existing)?)?;
                Ok(LoadedSettings {
                    path,
                    loaded_from_file: true,
                    settings,
                })
            }
            _ => {
                debug!(path = ?path, "no config file; using defaults");
                Ok(LoadedSettings {
                    path,
                    loaded_from_file: false,
                    settings: Self::default(),
                })
            }
        }
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(invalid("base_url", "\"\"", "a non-empty URL"));
        }
        if !(1..=100).contains(&self.concurrency) {
            return Err(invalid("concurrency", self.concurrency, "1..=100"));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(invalid("batch_size", self.batch_size, "1..=500"));
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_timeout_secs("search_timeout_secs", self.search_timeout_secs)?;
        if !(1..=20).contains(&self.auth_attempts) {
            return Err(invalid("auth_attempts", self.auth_attempts, "1..=20"));
        }
        if self.auth_backoff_ms > 60_000 {
            return Err(invalid("auth_backoff_ms", self.auth_backoff_ms, "0..=60000"));
        }
        Ok(())
    }

    /// HTTP client options derived from these settings.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.base_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            search_timeout: Duration::from_secs(self.search_timeout_secs),
            windows_client: self.windows_client,
        }
    }

    /// Login retry policy derived from these settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.auth_attempts,
            Duration::from_millis(self.auth_backoff_ms),
        )
    }
}

fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        field,
        value: value.to_string(),
        expected,
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(invalid(field, value, "1..=3600"));
    }
    Ok(())
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Resolves the default config path from the process environment.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    resolve_config_path_with(|name| std::env::var_os(name))
}

/// Resolves the default config path using `lookup` for environment variables.
pub fn resolve_config_path_with<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<OsString>,
{
    let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());

    if let Some(xdg_config_home) = non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join("config.toml"));
    }

    let home = non_empty("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

/// Builds the credential from `ICSD_LOGIN_ID` / `ICSD_PASSWORD`.
///
/// A `login_id` given on the command line takes precedence over the variable.
///
/// # Errors
///
/// Returns [`ConfigError::MissingCredential`] when a part is absent.
pub fn credential_from_env(login_id: Option<&str>) -> Result<Credential, ConfigError> {
    credential_with(login_id, |name| std::env::var(name).ok())
}

/// Like [`credential_from_env`] but with an injectable variable lookup.
///
/// # Errors
///
/// Returns [`ConfigError::MissingCredential`] when a part is absent.
pub fn credential_with<F>(login_id: Option<&str>, lookup: F) -> Result<Credential, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());

    let login_id = match login_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => non_empty(LOGIN_ID_ENV).ok_or(ConfigError::MissingCredential { var: LOGIN_ID_ENV })?,
    };
    let password =
        non_empty(PASSWORD_ENV).ok_or(ConfigError::MissingCredential { var: PASSWORD_ENV })?;

    Ok(Credential::new(login_id, password))
}
