use clap::Parser;
use std::{
    ffi::OsString,
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use super::ConfigError;
use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub listen_addr: SocketAddr,
    pub config_file_location: Option<PathBuf>,
    pub users_file_location: PathBuf,
    pub log_level: LogLevel,
}

impl CliConfig {
    /// Reads the process arguments. Malformed arguments print usage and exit.
    pub fn from_args() -> Result<Self, ConfigError> {
        Self::from_parsed(Args::parse())
    }

    pub fn try_from_iter<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = Args::try_parse_from(args).map_err(|e| ConfigError::Cli(e.to_string()))?;
        Self::from_parsed(args)
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Private ----------------------------------------------------

impl CliConfig {
    fn from_parsed(args: Args) -> Result<Self, ConfigError> {
        let cfg = Self {
            listen_addr: SocketAddr::from((args.host, args.port)),
            config_file_location: args.config_file,
            users_file_location: args.users_file,
            log_level: args.log_level,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.config_file_location {
            must_exist_file(path, "--config / shelfcrab.toml")?;
        }
        must_exist_file(&self.users_file_location, "--users / users.toml")
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "shelfcrab",
    version,
    about = "Session-aware gateway in front of a pooled backing store"
)]
struct Args {
    // IPv4 or IPv6 literal (e.g., 0.0.0.0, 127.0.0.1, ::, ::1). Required via CLI or ENV.
    #[arg(long = "host", short = 'H', env = "SHELFCRAB_HOST")]
    host: IpAddr,

    // Required via CLI or ENV.
    #[arg(long = "port", short = 'p', env = "SHELFCRAB_PORT")]
    port: u16,

    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,

    // Optional; built-in defaults apply without it.
    #[arg(long = "config", env = "SHELFCRAB_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    // Must exist; no defaults.
    #[arg(long = "users", env = "SHELFCRAB_USERS_FILE")]
    users_file: PathBuf,
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn must_exist_file(path: &Path, hint: &str) -> Result<(), ConfigError> {
    let md = fs::metadata(path).map_err(|_| ConfigError::MissingFile {
        path: path.to_path_buf(),
        hint: hint.to_string(),
    })?;

    if !md.is_file() {
        return Err(ConfigError::NotAFile {
            path: path.to_path_buf(),
            hint: hint.to_string(),
        });
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_required_and_optional_args() {
        let users = NamedTempFile::new().unwrap();
        let users_path = users.path().to_str().unwrap();

        let cfg = CliConfig::try_from_iter([
            "shelfcrab",
            "--host",
            "127.0.0.1",
            "--port",
            "7100",
            "--users",
            users_path,
            "--log",
            "debug",
        ])
        .unwrap();

        assert_eq!(cfg.listen_addr, "127.0.0.1:7100".parse().unwrap());
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.users_file_location, users.path());
    }

    #[test]
    fn missing_files_are_reported() {
        let err = CliConfig::try_from_iter([
            "shelfcrab",
            "--host",
            "::1",
            "--port",
            "7100",
            "--users",
            "/definitely/not/here/users.toml",
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile { .. }));

        let dir = tempfile::tempdir().unwrap();
        let err = CliConfig::try_from_iter([
            "shelfcrab".into(),
            "--host".into(),
            "::1".into(),
            "--port".into(),
            "7100".into(),
            "--users".into(),
            dir.path().as_os_str().to_owned(),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotAFile { .. }));
    }

    #[test]
    fn bad_host_is_a_cli_error() {
        let err = CliConfig::try_from_iter([
            "shelfcrab",
            "--host",
            "localhost",
            "--port",
            "7100",
            "--users",
            "users.toml",
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Cli(_)));
    }
}
