//! Session configuration.
//!
//! [`SessionConfig`] is consumed by [`SessionRegistry::start`](crate::session::SessionRegistry::start).
//! Every field has a default; embedders usually start from
//! `SessionConfig::default()` and override what they need, while the
//! `server-devtools` binary loads overrides from the environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SERVER_DEVTOOLS_HOST` | `127.0.0.1` | Observer listen host |
//! | `SERVER_DEVTOOLS_PORT` | 3001 | Observer listen port |
//! | `SERVER_DEVTOOLS_MAX_LOGS` | 10000 | Log records kept |
//! | `SERVER_DEVTOOLS_MAX_REQUESTS` | 5000 | Network records kept |
//! | `SERVER_DEVTOOLS_TRUNCATE_BODY_BYTES` | 1000000 | Body truncation limit |
//! | `SERVER_DEVTOOLS_CAPTURE_REQUEST_BODIES` | true | Keep request bodies |
//! | `SERVER_DEVTOOLS_CAPTURE_RESPONSE_BODIES` | true | Keep response bodies |
//! | `SERVER_DEVTOOLS_REDACT_HEADERS` | `authorization,cookie,set-cookie` | Comma-separated header names |
//! | `SERVER_DEVTOOLS_DISABLED` | false | Turn capture into a no-op |

use std::env;

use thiserror::Error;
use tracing::warn;

use crate::broadcast::DEFAULT_CHANNEL_CAPACITY;
use crate::collector::{DEFAULT_MAX_LOGS, DEFAULT_MAX_REQUESTS};
use crate::policy::{
    normalize_header_names, PolicySnapshot, DEFAULT_MIN_TRUNCATE_BODY_BYTES,
    DEFAULT_REDACT_HEADERS, DEFAULT_TRUNCATE_BODY_BYTES,
};

/// Default observer listen host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default observer listen port.
pub const DEFAULT_PORT: u16 = 3001;

const ENV_PREFIX: &str = "SERVER_DEVTOOLS_";

/// Errors that can occur when reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// A numeric variable did not parse.
    #[error("invalid number for {var}: {source}")]
    InvalidNumber {
        var: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Configuration for a capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// When false, `start` returns an inert handle and installs nothing.
    pub enabled: bool,

    /// Observer listen host.
    pub host: String,

    /// Observer listen port. 0 picks a free port.
    pub port: u16,

    /// Log ring buffer capacity.
    pub max_logs: usize,

    /// Network ring buffer capacity.
    pub max_requests: usize,

    /// Initial body truncation limit in bytes.
    pub truncate_body_bytes: usize,

    /// Lowest truncation limit accepted, initially or from observers.
    pub min_truncate_body_bytes: usize,

    pub capture_request_bodies: bool,

    pub capture_response_bodies: bool,

    /// Header names whose values are redacted.
    pub redact_headers: Vec<String>,

    /// Notification channel capacity. Observers further behind are re-baselined.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_logs: DEFAULT_MAX_LOGS,
            max_requests: DEFAULT_MAX_REQUESTS,
            truncate_body_bytes: DEFAULT_TRUNCATE_BODY_BYTES,
            min_truncate_body_bytes: DEFAULT_MIN_TRUNCATE_BODY_BYTES,
            capture_request_bodies: true,
            capture_response_bodies: true,
            redact_headers: DEFAULT_REDACT_HEADERS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Loads configuration from `SERVER_DEVTOOLS_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric variable does not parse or a
    /// variable is not valid unicode.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use server_devtools::config::SessionConfig;
    ///
    /// let config = SessionConfig::from_env().expect("invalid devtools configuration");
    /// println!("observers connect to ws://{}:{}", config.host, config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            enabled: !parse_bool_env("DISABLED", false)?,
            host: read_env("HOST")?.unwrap_or(defaults.host),
            port: parse_number_env("PORT", defaults.port)?,
            max_logs: parse_number_env("MAX_LOGS", defaults.max_logs)?,
            max_requests: parse_number_env("MAX_REQUESTS", defaults.max_requests)?,
            truncate_body_bytes: parse_number_env(
                "TRUNCATE_BODY_BYTES",
                defaults.truncate_body_bytes,
            )?,
            min_truncate_body_bytes: defaults.min_truncate_body_bytes,
            capture_request_bodies: parse_bool_env(
                "CAPTURE_REQUEST_BODIES",
                defaults.capture_request_bodies,
            )?,
            capture_response_bodies: parse_bool_env(
                "CAPTURE_RESPONSE_BODIES",
                defaults.capture_response_bodies,
            )?,
            redact_headers: match read_env("REDACT_HEADERS")? {
                Some(list) => list.split(',').map(str::to_string).collect(),
                None => defaults.redact_headers,
            },
            channel_capacity: defaults.channel_capacity,
        };

        if !config.enabled {
            warn!("{ENV_PREFIX}DISABLED is set - log and network capture is turned off");
        }

        Ok(config)
    }

    /// Returns a copy with every value clamped into its valid range.
    ///
    /// Capacities are at least 1, the truncation limit is at least the
    /// minimum, and the redact list is trimmed, lower-cased and deduplicated.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let min_truncate_body_bytes = self.min_truncate_body_bytes.max(1);
        Self {
            max_logs: self.max_logs.max(1),
            max_requests: self.max_requests.max(1),
            min_truncate_body_bytes,
            truncate_body_bytes: self.truncate_body_bytes.max(min_truncate_body_bytes),
            redact_headers: normalize_header_names(&self.redact_headers),
            channel_capacity: self.channel_capacity.max(1),
            ..self.clone()
        }
    }

    /// Returns the initial capture policy described by this configuration.
    #[must_use]
    pub fn policy(&self) -> PolicySnapshot {
        PolicySnapshot {
            truncate_body_bytes: self.truncate_body_bytes,
            capture_request_bodies: self.capture_request_bodies,
            capture_response_bodies: self.capture_response_bodies,
            redact_headers: self.redact_headers.clone(),
        }
    }

    /// Returns the `host:port` listen address.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reads `SERVER_DEVTOOLS_{name}`, treating unset and empty as absent.
fn read_env(name: &str) -> Result<Option<String>, ConfigError> {
    let var = format!("{ENV_PREFIX}{name}");
    match env::var(&var) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var,
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parses a boolean variable. Accepts `true`/`false`/`1`/`0`, case-insensitively.
fn parse_bool_env(name: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = read_env(name)? else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidFormat {
            var: format!("{ENV_PREFIX}{name}"),
            message: format!("expected 'true' or 'false', got '{value}'"),
        }),
    }
}

fn parse_number_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    match read_env(name)? {
        Some(value) => value
            .parse()
            .map_err(|source| ConfigError::InvalidNumber {
                var: format!("{ENV_PREFIX}{name}"),
                source,
            }),
        None => Ok(default),
    }
}
