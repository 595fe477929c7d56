//! Owner directory: the key rows report foreign keys point at.
//!
//! # Responsibility
//! - Answer `exists(owner)` for the user and organization directories.
//! - Let the owner-lifecycle collaborator register and remove owner keys.
//!
//! # Invariants
//! - `register` is idempotent.
//! - `remove` never orphans a report: under `RESTRICT` it fails with
//!   `ForeignKeyViolation` while a report references the owner; under
//!   `CASCADE` the report goes with it.

use super::postgres_repo::lock_client;
use super::report_repo::is_foreign_key_failure;
use super::{RepoResult, ReportError};
use crate::db::codec::encode_uuid;
use crate::model::report::Owner;
use postgres::error::SqlState;
use postgres::Client;
use rusqlite::{Connection, OptionalExtension};
use std::sync::Mutex;

pub trait OwnerDirectory {
    fn exists(&self, owner: &Owner) -> RepoResult<bool>;
    /// Inserts the owner's key row if it is not there yet.
    fn register(&self, owner: &Owner) -> RepoResult<()>;
    /// Deletes the owner's key row. Returns whether a row was removed.
    fn remove(&self, owner: &Owner) -> RepoResult<bool>;
}

pub struct SqliteOwnerDirectory<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteOwnerDirectory<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl OwnerDirectory for SqliteOwnerDirectory<'_> {
    fn exists(&self, owner: &Owner) -> RepoResult<bool> {
        let table = owner.kind().directory_table();
        let found = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE id = ?1;"),
                [encode_uuid(owner.as_uuid())],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn register(&self, owner: &Owner) -> RepoResult<()> {
        let table = owner.kind().directory_table();
        self.conn.execute(
            &format!("INSERT INTO {table} (id) VALUES (?1) ON CONFLICT (id) DO NOTHING;"),
            [encode_uuid(owner.as_uuid())],
        )?;
        Ok(())
    }

    fn remove(&self, owner: &Owner) -> RepoResult<bool> {
        let table = owner.kind().directory_table();
        let changed = self
            .conn
            .execute(
                &format!("DELETE FROM {table} WHERE id = ?1;"),
                [encode_uuid(owner.as_uuid())],
            )
            .map_err(|err| {
                if is_foreign_key_failure(&err) {
                    ReportError::ForeignKeyViolation(*owner)
                } else {
                    err.into()
                }
            })?;
        Ok(changed > 0)
    }
}

/// Directory over a client shared with a `PostgresReportRepository`.
pub struct PostgresOwnerDirectory<'a> {
    client: &'a Mutex<Client>,
}

impl<'a> PostgresOwnerDirectory<'a> {
    pub fn new(client: &'a Mutex<Client>) -> Self {
        Self { client }
    }
}

impl OwnerDirectory for PostgresOwnerDirectory<'_> {
    fn exists(&self, owner: &Owner) -> RepoResult<bool> {
        let table = owner.kind().directory_table();
        let sql = format!("SELECT 1 FROM {table} WHERE id = $1");
        let row = lock_client(self.client).query_opt(sql.as_str(), &[&owner.as_uuid()])?;
        Ok(row.is_some())
    }

    fn register(&self, owner: &Owner) -> RepoResult<()> {
        let table = owner.kind().directory_table();
        let sql = format!("INSERT INTO {table} (id) VALUES ($1) ON CONFLICT (id) DO NOTHING");
        lock_client(self.client).execute(sql.as_str(), &[&owner.as_uuid()])?;
        Ok(())
    }

    fn remove(&self, owner: &Owner) -> RepoResult<bool> {
        let table = owner.kind().directory_table();
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        let changed = lock_client(self.client)
            .execute(sql.as_str(), &[&owner.as_uuid()])
            .map_err(|err| match err.code() {
                Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
                    ReportError::ForeignKeyViolation(*owner)
                }
                _ => err.into(),
            })?;
        Ok(changed > 0)
    }
}
