//! Store configuration.
//!
//! # Responsibility
//! - Describe which backend to open and how to bootstrap it.
//! - Load settings from TOML with defaults for every optional key.
//!
//! # Example
//! ```toml
//! owner_delete_policy = "restrict"
//! list_page_size = 200
//!
//! [backend]
//! kind = "sqlite"
//! path = "/var/lib/exposure/reports.db"
//! busy_timeout_ms = 5000
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 25
//!
//! [logging]
//! level = "info"
//! dir = "/var/log/exposure"
//! ```

use crate::db::schema::OwnerDeletePolicy;
use crate::db::{Dialect, SqliteOptions};
use crate::logging::LogSettings;
use crate::repo::DEFAULT_PAGE_SIZE;
use crate::service::report_service::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

/// Path value that selects an in-memory SQLite database.
pub const SQLITE_IN_MEMORY: &str = ":memory:";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read config `{path}`: {source}"),
            Self::Parse(err) => write!(f, "invalid config syntax: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Sqlite {
        /// File path, or `:memory:`.
        path: String,
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
    Postgres {
        /// `postgres://` URL or key/value connection string.
        url: String,
    },
}

impl BackendConfig {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Sqlite { .. } => Dialect::Sqlite,
            Self::Postgres { .. } => Dialect::Postgres,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(value: RetryConfig) -> Self {
        Self {
            max_attempts: value.max_attempts,
            base_delay: Duration::from_millis(value.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace|debug|info|warn|error. Build-mode default when absent.
    #[serde(default)]
    pub level: Option<String>,
    /// Absolute log directory. Logging stays off when absent.
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub owner_delete_policy: OwnerDeletePolicy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_list_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl StoreConfig {
    /// Config for a SQLite file (or `:memory:`) with every other key defaulted.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Sqlite {
                path: path.into(),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            owner_delete_policy: OwnerDeletePolicy::default(),
            retry: RetryConfig::default(),
            list_page_size: default_list_page_size(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.backend {
            BackendConfig::Sqlite { path, .. } if path.trim().is_empty() => {
                return Err(ConfigError::Invalid("sqlite path cannot be empty".to_string()));
            }
            BackendConfig::Postgres { url } if url.trim().is_empty() => {
                return Err(ConfigError::Invalid("postgres url cannot be empty".to_string()));
            }
            _ => {}
        }
        if self.list_page_size == 0 {
            return Err(ConfigError::Invalid(
                "list_page_size must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".to_string(),
            ));
        }
        LogSettings::from_config(&self.logging)
            .map_err(|err| ConfigError::Invalid(format!("logging: {err}")))?;
        Ok(())
    }

    /// SQLite bootstrap options, when the backend is SQLite.
    pub fn sqlite_options(&self) -> Option<SqliteOptions> {
        match &self.backend {
            BackendConfig::Sqlite {
                busy_timeout_ms, ..
            } => Some(SqliteOptions {
                busy_timeout: Duration::from_millis(*busy_timeout_ms),
                owner_delete_policy: self.owner_delete_policy,
            }),
            BackendConfig::Postgres { .. } => None,
        }
    }
}
