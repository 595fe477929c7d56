//! Config-driven store bootstrap.
//!
//! # Responsibility
//! - Apply the `[logging]` section, then open the configured backend and
//!   hand out backend-agnostic handles.
//!
//! # Invariants
//! - Callers only see `ReportRepository` / `OwnerDirectory`; no backend type
//!   leaks through `ReportStore`.

use crate::config::{BackendConfig, ConfigError, StoreConfig, SQLITE_IN_MEMORY};
use crate::db::{open_db_in_memory_with, open_db_with, DbError, Dialect, SqliteOptions};
use crate::logging::{init_logging_from_config, log_store_open, LoggingError};
use crate::repo::directory::{OwnerDirectory, SqliteOwnerDirectory};
use crate::repo::postgres_repo::PostgresReportRepository;
use crate::repo::report_repo::SqliteReportRepository;
use crate::repo::{RepoResult, ReportRepository, ReportStream};
use crate::service::report_service::{ReportService, RetryPolicy};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

#[derive(Debug)]
pub enum StoreOpenError {
    Config(ConfigError),
    Logging(LoggingError),
    Db(DbError),
}

impl Display for StoreOpenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Logging(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreOpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Logging(err) => Some(err),
            Self::Db(err) => Some(err),
        }
    }
}

impl From<ConfigError> for StoreOpenError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LoggingError> for StoreOpenError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

impl From<DbError> for StoreOpenError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

enum Backend {
    Sqlite(Connection),
    Postgres(PostgresReportRepository),
}

/// An opened, migrated report store.
pub struct ReportStore {
    backend: Backend,
    retry: RetryPolicy,
    page_size: u32,
}

/// Validates `config` and applies its logging section, then opens and
/// migrates the backend.
pub fn open_store(config: &StoreConfig) -> Result<ReportStore, StoreOpenError> {
    config.validate()?;
    init_logging_from_config(&config.logging)?;

    let started_at = Instant::now();
    let result = open_backend(config).map(|backend| ReportStore {
        backend,
        retry: config.retry.into(),
        page_size: config.list_page_size,
    });
    log_store_open(
        config.backend.dialect(),
        started_at.elapsed().as_millis(),
        &result,
    );
    result
}

fn open_backend(config: &StoreConfig) -> Result<Backend, StoreOpenError> {
    let backend = match &config.backend {
        BackendConfig::Sqlite { path, .. } => {
            let options = config.sqlite_options().unwrap_or_else(SqliteOptions::default);
            let conn = if path == SQLITE_IN_MEMORY {
                open_db_in_memory_with(&options)?
            } else {
                open_db_with(path, &options)?
            };
            Backend::Sqlite(conn)
        }
        BackendConfig::Postgres { url } => Backend::Postgres(PostgresReportRepository::connect(
            url,
            config.owner_delete_policy,
        )?),
    };
    Ok(backend)
}

impl ReportStore {
    pub fn dialect(&self) -> Dialect {
        match &self.backend {
            Backend::Sqlite(_) => Dialect::Sqlite,
            Backend::Postgres(_) => Dialect::Postgres,
        }
    }

    pub fn repository(&self) -> RepoResult<Box<dyn ReportRepository + '_>> {
        let repo: Box<dyn ReportRepository + '_> = match &self.backend {
            Backend::Sqlite(conn) => Box::new(SqliteReportRepository::try_new(conn)?),
            Backend::Postgres(repo) => Box::new(repo),
        };
        Ok(repo)
    }

    pub fn directory(&self) -> Box<dyn OwnerDirectory + '_> {
        let directory: Box<dyn OwnerDirectory + '_> = match &self.backend {
            Backend::Sqlite(conn) => Box::new(SqliteOwnerDirectory::new(conn)),
            Backend::Postgres(repo) => Box::new(repo.directory()),
        };
        directory
    }

    /// Scan service over this store with the configured retry policy and
    /// page size.
    pub fn service(&self) -> RepoResult<ReportService<Box<dyn ReportRepository + '_>>> {
        let service = ReportService::with_retry(self.repository()?, self.retry);
        Ok(service.with_page_size(self.page_size))
    }

    /// `list_since` using the configured page size.
    pub fn list_since<'a>(
        &self,
        repo: &'a (dyn ReportRepository + 'a),
        since: DateTime<Utc>,
    ) -> ReportStream<'a> {
        ReportStream::new(repo, since).with_page_size(self.page_size)
    }
}
