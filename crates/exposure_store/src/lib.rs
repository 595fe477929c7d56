//! Persistence for per-owner exposure reports.
//! One report per user or organization, kept current by the exposure scanner
//! and read back by reporting callers.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use config::{BackendConfig, ConfigError, LoggingConfig, RetryConfig, StoreConfig};
pub use db::schema::OwnerDeletePolicy;
pub use db::{DbError, Dialect};
pub use logging::{
    default_level, init_logging, init_logging_from_config, logging_status, LogSettings,
    LoggingError,
};
pub use model::report::{
    OrganizationId, Owner, OwnerKind, Report, ReportId, ReportValidationError, UserId,
};
pub use repo::directory::{OwnerDirectory, PostgresOwnerDirectory, SqliteOwnerDirectory};
pub use repo::postgres_repo::PostgresReportRepository;
pub use repo::report_repo::SqliteReportRepository;
pub use repo::{
    ListCursor, ListPageQuery, RepoResult, ReportError, ReportRepository, ReportStream,
};
pub use service::report_service::{ReportService, RetryPolicy};
pub use store::{open_store, ReportStore, StoreOpenError};

/// Returns the store crate version.
pub fn store_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::store_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!store_version().is_empty());
    }
}
