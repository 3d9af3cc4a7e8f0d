use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;

use crate::shared_types::Role;

// -----------------------------------------------------------------------------
// ----- UsersConfig -----------------------------------------------------------

/// The accounts allowed to log in. Cheap to clone; clones share one map.
#[derive(Debug, Clone)]
pub struct UsersConfig {
    inner: Arc<RwLock<UsersMap>>,
}

// -----------------------------------------------------------------------------
// ----- UsersConfig: Static ---------------------------------------------------

impl UsersConfig {
    pub async fn load(path: &Path) -> Result<UsersConfig, UsersError> {
        let raw = fs::read_to_string(path).await.map_err(|e| UsersError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<UsersConfig, UsersError> {
        let mut doc: UsersFile = toml::from_str(raw).map_err(|e| UsersError::Toml { source: e })?;

        if doc.users.is_empty() {
            return Err(UsersError::EmptyConfig);
        }

        let mut by_key = HashMap::with_capacity(doc.users.len());
        let mut ids = HashSet::with_capacity(doc.users.len());

        for user in doc.users.drain(..) {
            validate(&user)?;

            if !ids.insert(user.id) {
                return Err(UsersError::DuplicateId { id: user.id });
            }

            let record = UserRecord {
                id: user.id,
                username: user.username.clone(),
                password: SecretString::new(user.password.into_boxed_str()),
                role: user.role,
            };

            let key = UserKey::new(&record.username);
            if by_key.insert(key, record).is_some() {
                return Err(UsersError::DuplicateUser {
                    username: user.username,
                });
            }
        }

        Ok(UsersConfig {
            inner: Arc::new(RwLock::new(UsersMap { by_key })),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- UsersConfig: Public ---------------------------------------------------

impl UsersConfig {
    pub fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord, UsersError> {
        let key = UserKey::new(username);

        let guard = self.inner.read();
        let user = guard
            .by_key
            .get(&key)
            .ok_or_else(|| UsersError::UnknownUser {
                username: username.to_string(),
            })?;

        if user.password.expose_secret() != password {
            return Err(UsersError::BadPassword);
        }

        Ok(user.clone())
    }

    pub fn snapshot(&self) -> Vec<UserRecord> {
        let guard = self.inner.read();
        let mut users: Vec<UserRecord> = guard.by_key.values().cloned().collect();
        users.sort_by_key(|user| user.id);
        users
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: map/key -----------------------------------------------------

#[derive(Debug, Clone, Default)]
struct UsersMap {
    by_key: HashMap<UserKey, UserRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserKey {
    username: String,
}

impl UserKey {
    fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UsersFileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsersFileEntry {
    id: u64,

    #[serde(alias = "name")]
    username: String,

    password: String,

    #[serde(default)]
    role: Role,
}

// -----------------------------------------------------------------------------
// ----- Internal: In-memory record --------------------------------------------

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    pub password: SecretString,
    pub role: Role,
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn validate(u: &UsersFileEntry) -> Result<(), UsersError> {
    if u.username.trim().is_empty() {
        return Err(UsersError::InvalidField("username".into()));
    }
    if u.username.contains('|') {
        return Err(UsersError::InvalidField("username".into()));
    }
    if u.password.is_empty() {
        return Err(UsersError::InvalidField("password".into()));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum UsersError {
    #[error("users config is empty")]
    EmptyConfig,

    #[error("duplicate [[users]] entry for user '{username}'")]
    DuplicateUser { username: String },

    #[error("duplicate [[users]] entry for id {id}")]
    DuplicateId { id: u64 },

    #[error("unknown user '{username}'")]
    UnknownUser { username: String },

    #[error("invalid or missing field '{0}'")]
    InvalidField(String),

    #[error("bad password")]
    BadPassword,

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
