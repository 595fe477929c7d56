//! Migration registry and executors for both backends.
//!
//! # Responsibility
//! - Register schema migrations in strictly increasing order.
//! - Apply pending migrations atomically.
//!
//! # Invariants
//! - `version` values must remain monotonic.
//! - SQLite mirrors the applied version to `PRAGMA user_version`.
//! - PostgreSQL records one `schema_migrations` row per applied version.

use crate::db::schema::{owner_directories_ddl, owner_unique_ddl, reports_ddl, OwnerDeletePolicy};
use crate::db::{DbError, DbResult, Dialect};
use log::info;
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: String,
}

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> u32 {
    migrations(Dialect::Sqlite, OwnerDeletePolicy::default())
        .last()
        .map_or(0, |migration| migration.version)
}

/// Builds the ordered migration list for one dialect and delete policy.
pub fn migrations(dialect: Dialect, policy: OwnerDeletePolicy) -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "owner_directories",
            sql: owner_directories_ddl(dialect),
        },
        Migration {
            version: 2,
            name: "reports",
            sql: reports_ddl(dialect, policy),
        },
        Migration {
            version: 3,
            name: "reports_owner_unique",
            sql: owner_unique_ddl(dialect),
        },
    ]
}

/// Applies all pending migrations on the provided SQLite connection.
pub fn apply_migrations(conn: &mut Connection, policy: OwnerDeletePolicy) -> DbResult<()> {
    let current_version = current_user_version(conn)?;
    let latest = latest_version();

    if current_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: current_version,
            latest_supported: latest,
        });
    }

    if current_version == latest {
        return Ok(());
    }

    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    // Another connection may have migrated while this one waited for the lock.
    let locked_version: u32 = tx.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    for migration in migrations(Dialect::Sqlite, policy) {
        if migration.version <= locked_version {
            continue;
        }

        tx.execute_batch(&migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
        info!(
            "event=db_migrate module=db status=ok backend=sqlite version={} name={}",
            migration.version, migration.name
        );
    }
    tx.commit()?;

    Ok(())
}

/// Applies all pending migrations on the provided PostgreSQL client.
///
/// The bookkeeping table is locked for the whole run so concurrent
/// bootstraps apply each migration once.
pub fn apply_postgres_migrations(
    client: &mut postgres::Client,
    policy: OwnerDeletePolicy,
) -> DbResult<()> {
    client.batch_execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );",
    )?;

    let mut tx = client.transaction()?;
    tx.batch_execute("LOCK TABLE schema_migrations IN EXCLUSIVE MODE;")?;
    let row = tx.query_one("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", &[])?;
    let current: i32 = row.try_get(0)?;
    let current_version = u32::try_from(current).unwrap_or(0);
    let latest = latest_version();

    if current_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: current_version,
            latest_supported: latest,
        });
    }

    for migration in migrations(Dialect::Postgres, policy) {
        if migration.version <= current_version {
            continue;
        }

        tx.batch_execute(&migration.sql)?;
        let version = i32::try_from(migration.version).unwrap_or(i32::MAX);
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2)",
            &[&version, &migration.name],
        )?;
        info!(
            "event=db_migrate module=db status=ok backend=postgres version={} name={}",
            migration.version, migration.name
        );
    }
    tx.commit()?;

    Ok(())
}

pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}
