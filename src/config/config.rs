use parking_lot::RwLock;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
};
use thiserror::Error;

use super::{
    cli::CliConfig,
    settings::{Settings, SettingsError},
    types::LogLevel,
    users::{UsersConfig, UsersError},
};

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static ROOT_CONFIG: OnceLock<Arc<RwLock<Config>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- Config ----------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: LogLevel,
    pub settings: Settings,
    pub users: UsersConfig,
}

// -----------------------------------------------------------------------------
// ----- Config: Static --------------------------------------------------------

impl Config {
    /// Async because the settings and users files are read with non-blocking IO.
    pub async fn init() -> Result<(), ConfigError> {
        let cli = CliConfig::from_args()?;
        let next = Self::load(cli).await?;

        if let Some(handle) = ROOT_CONFIG.get() {
            *handle.write() = next;
        } else {
            let _ = ROOT_CONFIG.set(Arc::new(RwLock::new(next)));
        }
        Ok(())
    }

    /// Builds a config from already-parsed arguments without touching the
    /// process-wide snapshot.
    pub async fn load(cli: CliConfig) -> Result<Config, ConfigError> {
        let settings = Settings::load(cli.config_file_location.as_deref()).await?;
        let users = UsersConfig::load(&cli.users_file_location).await?;

        Ok(Config {
            listen_addr: cli.listen_addr,
            log_level: cli.log_level,
            settings,
            users,
        })
    }

    pub fn snapshot() -> Config {
        Self::handle().read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- Config: Private -------------------------------------------------------

impl Config {
    fn handle() -> Arc<RwLock<Config>> {
        ROOT_CONFIG
            .get()
            .expect("Config not initialized; call Config::init().await first")
            .clone()
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CLI/ENV: {0}")]
    Cli(String),

    #[error("required file missing: {} (from {hint})", path.display())]
    MissingFile { path: PathBuf, hint: String },

    #[error("path is not a file: {} (from {hint})", path.display())]
    NotAFile { path: PathBuf, hint: String },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Users(#[from] UsersError),
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
