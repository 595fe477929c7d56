//! Storage bootstrap, schema and migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections and PostgreSQL clients.
//! - Render the report schema for each backend dialect.
//! - Apply schema migrations in deterministic order.
//!
//! # Invariants
//! - SQLite migration version is tracked via `PRAGMA user_version`;
//!   PostgreSQL uses the `schema_migrations` table.
//! - Core code must not read/write report data before migrations succeed.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod codec;
pub mod migrations;
mod open;
pub mod pg;
pub mod schema;

pub use open::{open_db, open_db_in_memory, open_db_in_memory_with, open_db_with, SqliteOptions};

pub type DbResult<T> = Result<T, DbError>;

/// Storage backend family. Selects DDL and value encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Identifiers as canonical text, timestamps as RFC 3339 UTC text.
    Sqlite,
    /// Native `UUID` and `TIMESTAMPTZ` columns.
    Postgres,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl Display for Dialect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Postgres(postgres::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Postgres(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Postgres(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<postgres::Error> for DbError {
    fn from(value: postgres::Error) -> Self {
        Self::Postgres(value)
    }
}
