use serde::Deserialize;
use std::{path::Path, time::Duration};
use thiserror::Error;
use tokio::fs;

use crate::gateway::{admission, pool, session};
use crate::gateway::{AdmissionSettings, GatewaySettings, PoolSettings, SessionSettings};
use crate::server::{self, ServerSettings};

// -----------------------------------------------------------------------------
// ----- Settings --------------------------------------------------------------

/// Runtime tuning read from the optional settings file. Every key is optional
/// and falls back to the built-in default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub server: ServerSettings,
}

// -----------------------------------------------------------------------------
// ----- Settings: Static ------------------------------------------------------

impl Settings {
    /// `None` means no settings file: defaults everywhere.
    pub async fn load(path: Option<&Path>) -> Result<Settings, SettingsError> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };

        let raw = fs::read_to_string(path).await.map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Settings, SettingsError> {
        let doc: SettingsFile =
            toml::from_str(raw).map_err(|e| SettingsError::Toml { source: e })?;

        let settings = Settings {
            gateway: GatewaySettings {
                pool: PoolSettings {
                    initial_size: doc.pool.initial_size,
                    max_size: doc.pool.max_size,
                    acquire_timeout: doc.pool.acquire_timeout,
                },
                sessions: SessionSettings {
                    idle_timeout: doc.sessions.idle_timeout,
                    sweep_interval: doc.sessions.sweep_interval,
                },
                admission: AdmissionSettings {
                    per_second: doc.admission.per_second,
                    per_minute: doc.admission.per_minute,
                    idle_grace: doc.admission.idle_grace,
                },
            },
            server: ServerSettings {
                max_connections: doc.server.max_connections,
            },
        };

        validate(&settings)?;
        Ok(settings)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    pool: PoolSection,
    sessions: SessionsSection,
    admission: AdmissionSection,
    server: ServerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PoolSection {
    initial_size: usize,
    max_size: usize,

    #[serde(deserialize_with = "de_duration")]
    acquire_timeout: Duration,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            initial_size: pool::DEFAULT_INITIAL_SIZE,
            max_size: pool::DEFAULT_MAX_SIZE,
            acquire_timeout: pool::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SessionsSection {
    #[serde(deserialize_with = "de_duration")]
    idle_timeout: Duration,

    #[serde(deserialize_with = "de_duration")]
    sweep_interval: Duration,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            idle_timeout: session::DEFAULT_IDLE_TIMEOUT,
            sweep_interval: session::DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AdmissionSection {
    per_second: u32,
    per_minute: u32,

    #[serde(deserialize_with = "de_duration")]
    idle_grace: Duration,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            per_second: admission::DEFAULT_PER_SECOND,
            per_minute: admission::DEFAULT_PER_MINUTE,
            idle_grace: admission::DEFAULT_IDLE_GRACE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            max_connections: server::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn validate(s: &Settings) -> Result<(), SettingsError> {
    let gw = &s.gateway;

    if gw.pool.max_size == 0 {
        return Err(SettingsError::Invalid("pool.max_size must be at least 1"));
    }
    if gw.pool.initial_size > gw.pool.max_size {
        return Err(SettingsError::Invalid(
            "pool.initial_size must not exceed pool.max_size",
        ));
    }
    if gw.pool.acquire_timeout.is_zero() {
        return Err(SettingsError::Invalid("pool.acquire_timeout must be positive"));
    }
    if gw.sessions.idle_timeout.is_zero() || gw.sessions.sweep_interval.is_zero() {
        return Err(SettingsError::Invalid("sessions durations must be positive"));
    }
    if gw.admission.per_second == 0 || gw.admission.per_minute == 0 {
        return Err(SettingsError::Invalid("admission caps must be at least 1"));
    }
    if s.server.max_connections == 0 {
        return Err(SettingsError::Invalid(
            "server.max_connections must be at least 1",
        ));
    }
    Ok(())
}

/// Accepts a humantime string (`"30s"`, `"5m"`, `"1h 30m"`) or an integer
/// number of milliseconds.
fn de_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, Unexpected, Visitor};
    use std::fmt;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"30s\" or integer milliseconds")
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                return Err(E::invalid_value(Unexpected::Signed(v), &self));
            }
            Ok(Duration::from_millis(v as u64))
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_any(DurationVisitor)
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Invalid(&'static str),

    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
