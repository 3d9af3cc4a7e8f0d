pub mod cli;
#[allow(clippy::module_inception)]
pub mod config;
pub mod settings;
pub mod types;
pub mod users;

pub use config::{Config, ConfigError};
pub use settings::{Settings, SettingsError};
pub use types::LogLevel;
pub use users::{UserRecord, UsersConfig, UsersError};
