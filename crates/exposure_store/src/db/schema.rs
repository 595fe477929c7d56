//! Report schema, rendered per backend dialect.
//!
//! # Responsibility
//! - Declare the `reports` table, its primary key and owner foreign keys.
//! - Declare the minimal `users` / `organizations` key tables the foreign
//!   keys point at.
//! - Keep column semantics identical across dialects; only the column
//!   types differ.
//!
//! # Invariants
//! - Identifier columns are `TEXT` (canonical uuid text) on SQLite and
//!   native `UUID` on PostgreSQL.
//! - Timestamp columns are fixed-width RFC 3339 UTC `TEXT` on SQLite and
//!   `TIMESTAMPTZ` on PostgreSQL. Neither backend stores naive datetimes.
//! - Owner foreign keys default to `ON DELETE RESTRICT`.

use super::Dialect;
use serde::{Deserialize, Serialize};

pub const REPORTS_TABLE: &str = "reports";

/// Columns every dialect must expose on `reports`, in declaration order.
pub const REPORT_COLUMNS: [&str; 6] = [
    "id",
    "owner_user",
    "owner_org",
    "exposed_count",
    "created_at",
    "last_updated_at",
];

/// Referential action applied to reports when their owner row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerDeletePolicy {
    /// Owner deletion fails while a report still references it.
    #[default]
    Restrict,
    /// Owner deletion removes its report.
    Cascade,
}

impl OwnerDeletePolicy {
    pub fn sql_action(self) -> &'static str {
        match self {
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
        }
    }
}

pub fn id_column_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "TEXT",
        Dialect::Postgres => "UUID",
    }
}

pub fn timestamp_column_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "TEXT",
        Dialect::Postgres => "TIMESTAMPTZ",
    }
}

/// Minimal owner directory tables. Identity management lives elsewhere;
/// these rows exist so the report foreign keys have a target.
pub fn owner_directories_ddl(dialect: Dialect) -> String {
    let id_type = id_column_type(dialect);
    format!(
        "CREATE TABLE IF NOT EXISTS users (
    id {id_type} PRIMARY KEY NOT NULL
);

CREATE TABLE IF NOT EXISTS organizations (
    id {id_type} PRIMARY KEY NOT NULL
);
"
    )
}

/// The `reports` table. Exactly one owner column is set on every row.
pub fn reports_ddl(dialect: Dialect, policy: OwnerDeletePolicy) -> String {
    let id_type = id_column_type(dialect);
    let ts_type = timestamp_column_type(dialect);
    let action = policy.sql_action();
    format!(
        "CREATE TABLE IF NOT EXISTS reports (
    id {id_type} PRIMARY KEY NOT NULL,
    owner_user {id_type} NULL REFERENCES users(id) ON DELETE {action},
    owner_org {id_type} NULL REFERENCES organizations(id) ON DELETE {action},
    exposed_count INTEGER NOT NULL,
    created_at {ts_type} NOT NULL,
    last_updated_at {ts_type} NOT NULL,
    CHECK ((owner_user IS NULL) <> (owner_org IS NULL)),
    CHECK (exposed_count >= 0)
);
"
    )
}

/// One report per owner, plus the `list_since` ordering index.
///
/// Both dialects accept the same partial-index syntax, and both let an
/// `ON CONFLICT (col) WHERE col IS NOT NULL` clause target these indexes.
pub fn owner_unique_ddl(_dialect: Dialect) -> String {
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_reports_owner_user
    ON reports (owner_user) WHERE owner_user IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS ux_reports_owner_org
    ON reports (owner_org) WHERE owner_org IS NOT NULL;

CREATE INDEX IF NOT EXISTS ix_reports_last_updated
    ON reports (last_updated_at, id);
"
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::{owner_unique_ddl, reports_ddl, OwnerDeletePolicy};
    use crate::db::Dialect;

    #[test]
    fn sqlite_reports_use_text_columns() {
        let ddl = reports_ddl(Dialect::Sqlite, OwnerDeletePolicy::Restrict);
        assert!(ddl.contains("id TEXT PRIMARY KEY"));
        assert!(ddl.contains("created_at TEXT NOT NULL"));
        assert!(ddl.contains("ON DELETE RESTRICT"));
        assert!(!ddl.contains("UUID"));
        assert!(ddl.contains("CHECK ((owner_user IS NULL) <> (owner_org IS NULL))"));
    }

    #[test]
    fn postgres_reports_use_native_columns() {
        let ddl = reports_ddl(Dialect::Postgres, OwnerDeletePolicy::Cascade);
        assert!(ddl.contains("id UUID PRIMARY KEY"));
        assert!(ddl.contains("owner_org UUID NULL REFERENCES organizations(id)"));
        assert!(ddl.contains("last_updated_at TIMESTAMPTZ NOT NULL"));
        assert!(ddl.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn owner_indexes_are_partial() {
        let ddl = owner_unique_ddl(Dialect::Sqlite);
        assert!(ddl.contains("WHERE owner_user IS NOT NULL"));
        assert!(ddl.contains("WHERE owner_org IS NOT NULL"));
    }
}
