//! Report repository, SQLite implementation.
//!
//! # Responsibility
//! - Provide the report contract over the text-encoded `reports` table.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Writes run under `BEGIN IMMEDIATE`, so concurrent writers on other
//!   connections serialize on the database lock.
//! - Write timestamps are sampled after the lock is held, so timestamp order
//!   follows commit order and a row's count and `last_updated_at` always come
//!   from the same call.
//! - `upsert` is a single `INSERT .. ON CONFLICT .. DO UPDATE` statement
//!   targeting the owner's partial unique index.
//! - Every `upsert` moves `last_updated_at` strictly forward, by at least one
//!   microsecond when the clock has not advanced.

use super::{log_outcome, ListPageQuery, RepoResult, ReportError, ReportRepository};
use crate::db::codec::{ceil_to_micros, decode_timestamp, decode_uuid, encode_timestamp, encode_uuid};
use crate::db::migrations::latest_version;
use crate::db::schema::REPORTS_TABLE;
use crate::db::Dialect;
use crate::model::report::{truncate_to_micros, validate_count, Owner, OwnerKind, Report, ReportId};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::types::Value;
use rusqlite::{
    ffi, params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use std::time::Instant;

const REPORT_SELECT_SQL: &str = "SELECT
    id,
    owner_user,
    owner_org,
    exposed_count,
    created_at,
    last_updated_at
FROM reports";

const INSERT_SQL: &str = "INSERT INTO reports (
    id,
    owner_user,
    owner_org,
    exposed_count,
    created_at,
    last_updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
RETURNING id, owner_user, owner_org, exposed_count, created_at, last_updated_at;";

const UPSERT_USER_SQL: &str = "INSERT INTO reports (
    id,
    owner_user,
    owner_org,
    exposed_count,
    created_at,
    last_updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT (owner_user) WHERE owner_user IS NOT NULL DO UPDATE SET
    exposed_count = excluded.exposed_count,
    last_updated_at = excluded.last_updated_at
RETURNING id, owner_user, owner_org, exposed_count, created_at, last_updated_at;";

const UPSERT_ORG_SQL: &str = "INSERT INTO reports (
    id,
    owner_user,
    owner_org,
    exposed_count,
    created_at,
    last_updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT (owner_org) WHERE owner_org IS NOT NULL DO UPDATE SET
    exposed_count = excluded.exposed_count,
    last_updated_at = excluded.last_updated_at
RETURNING id, owner_user, owner_org, exposed_count, created_at, last_updated_at;";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Upsert,
}

impl WriteMode {
    fn sql(self, kind: OwnerKind) -> &'static str {
        match (self, kind) {
            (Self::Create, _) => INSERT_SQL,
            (Self::Upsert, OwnerKind::User) => UPSERT_USER_SQL,
            (Self::Upsert, OwnerKind::Organization) => UPSERT_ORG_SQL,
        }
    }
}

/// Column values exactly as SQLite returns them.
struct RawReportRow {
    id: String,
    owner_user: Option<String>,
    owner_org: Option<String>,
    exposed_count: i64,
    created_at: String,
    last_updated_at: String,
}

/// SQLite-backed report repository.
pub struct SqliteReportRepository<'conn> {
    conn: &'conn Connection,
    clock: fn() -> DateTime<Utc>,
}

impl<'conn> SqliteReportRepository<'conn> {
    /// Constructs a repository from a migrated connection.
    ///
    /// # Errors
    /// - `UninitializedConnection` when the schema version is not current.
    /// - `MissingRequiredTable` when `reports` is absent.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_report_connection_ready(conn)?;
        Ok(Self {
            conn,
            clock: Utc::now,
        })
    }

    /// Replaces the wall clock used to stamp writes.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Stamps and writes one report under the database write lock.
    ///
    /// `count` must already be validated. For upserts the stamp is pushed
    /// past the owner's stored `last_updated_at`.
    fn write_returning(&self, mode: WriteMode, owner: &Owner, count: u32) -> RepoResult<Report> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut stamp = truncate_to_micros((self.clock)());
        if mode == WriteMode::Upsert {
            if let Some(previous) = stored_last_updated_at(&tx, owner)? {
                stamp = stamp.max(previous + TimeDelta::microseconds(1));
            }
        }
        let report = Report::new(*owner, i64::from(count), stamp)?;

        let (owner_user, owner_org) = report.owner.to_columns();
        let raw = tx
            .query_row(
                mode.sql(owner.kind()),
                params![
                    encode_uuid(report.id.as_uuid()),
                    owner_user.map(encode_uuid),
                    owner_org.map(encode_uuid),
                    i64::from(report.exposed_count),
                    encode_timestamp(report.created_at),
                ],
                read_raw_row,
            )
            .map_err(|err| map_write_error(err, &report.owner))?;
        let stored = decode_report(raw)?;
        tx.commit()?;
        Ok(stored)
    }

    fn delete_where(&self, column: &'static str, value: String) -> RepoResult<bool> {
        let changed = self
            .conn
            .execute(&format!("DELETE FROM reports WHERE {column} = ?1;"), [value])?;
        Ok(changed > 0)
    }
}

impl ReportRepository for SqliteReportRepository<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn create(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        let started_at = Instant::now();
        let result = validate_count(count)
            .map_err(ReportError::from)
            .and_then(|count| self.write_returning(WriteMode::Create, owner, count));
        log_outcome("report_create", Dialect::Sqlite, Some(owner), started_at, &result);
        result
    }

    fn upsert(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        let started_at = Instant::now();
        let result = validate_count(count)
            .map_err(ReportError::from)
            .and_then(|count| self.write_returning(WriteMode::Upsert, owner, count));
        log_outcome("report_upsert", Dialect::Sqlite, Some(owner), started_at, &result);
        result
    }

    fn get_by_owner(&self, owner: &Owner) -> RepoResult<Option<Report>> {
        let column = owner.kind().column();
        let mut stmt = self
            .conn
            .prepare(&format!("{REPORT_SELECT_SQL} WHERE {column} = ?1;"))?;
        let mut rows = stmt.query([encode_uuid(owner.as_uuid())])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(decode_report(read_raw_row(row)?)?));
        }

        Ok(None)
    }

    fn get_by_id(&self, id: ReportId) -> RepoResult<Option<Report>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{REPORT_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([encode_uuid(id.as_uuid())])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(decode_report(read_raw_row(row)?)?));
        }

        Ok(None)
    }

    fn delete(&self, owner: &Owner) -> RepoResult<bool> {
        let started_at = Instant::now();
        let result = self.delete_where(owner.kind().column(), encode_uuid(owner.as_uuid()));
        log_outcome("report_delete", Dialect::Sqlite, Some(owner), started_at, &result);
        result
    }

    fn delete_by_id(&self, id: ReportId) -> RepoResult<bool> {
        let started_at = Instant::now();
        let result = self.delete_where("id", encode_uuid(id.as_uuid()));
        log_outcome("report_delete", Dialect::Sqlite, None, started_at, &result);
        result
    }

    fn list_since_page(&self, query: &ListPageQuery) -> RepoResult<Vec<Report>> {
        let mut sql = format!("{REPORT_SELECT_SQL} WHERE last_updated_at >= ?");
        let mut bind_values: Vec<Value> =
            vec![Value::Text(encode_timestamp(ceil_to_micros(query.since)))];

        if let Some(until) = query.until {
            sql.push_str(" AND last_updated_at <= ?");
            bind_values.push(Value::Text(encode_timestamp(until)));
        }

        if let Some(after) = query.after {
            let after_ts = encode_timestamp(after.last_updated_at);
            sql.push_str(" AND (last_updated_at > ? OR (last_updated_at = ? AND id > ?))");
            bind_values.push(Value::Text(after_ts.clone()));
            bind_values.push(Value::Text(after_ts));
            bind_values.push(Value::Text(encode_uuid(after.id.as_uuid())));
        }

        sql.push_str(" ORDER BY last_updated_at ASC, id ASC LIMIT ?");
        bind_values.push(Value::Integer(i64::from(query.limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut reports = Vec::new();
        while let Some(row) = rows.next()? {
            reports.push(decode_report(read_raw_row(row)?)?);
        }

        Ok(reports)
    }

    fn count(&self) -> RepoResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM reports;", [], |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| ReportError::InvalidData(format!("negative row count {count}")))
    }
}

fn stored_last_updated_at(
    tx: &Transaction<'_>,
    owner: &Owner,
) -> RepoResult<Option<DateTime<Utc>>> {
    let column = owner.kind().column();
    let raw: Option<String> = tx
        .query_row(
            &format!("SELECT last_updated_at FROM reports WHERE {column} = ?1;"),
            [encode_uuid(owner.as_uuid())],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|value| {
        decode_timestamp(&value).ok_or_else(|| {
            ReportError::InvalidData(format!(
                "invalid timestamp `{value}` in reports.last_updated_at"
            ))
        })
    })
    .transpose()
}

fn read_raw_row(row: &Row<'_>) -> rusqlite::Result<RawReportRow> {
    Ok(RawReportRow {
        id: row.get("id")?,
        owner_user: row.get("owner_user")?,
        owner_org: row.get("owner_org")?,
        exposed_count: row.get("exposed_count")?,
        created_at: row.get("created_at")?,
        last_updated_at: row.get("last_updated_at")?,
    })
}

fn decode_report(raw: RawReportRow) -> RepoResult<Report> {
    let id = decode_uuid(&raw.id)
        .map(ReportId::from_uuid)
        .ok_or_else(|| ReportError::InvalidData(format!("invalid uuid `{}` in reports.id", raw.id)))?;

    let owner = Owner::from_columns(raw.owner_user.as_deref(), raw.owner_org.as_deref())
        .map_err(|err| ReportError::InvalidData(format!("report {id}: {err}")))?;

    let exposed_count = u32::try_from(raw.exposed_count).map_err(|_| {
        ReportError::InvalidData(format!(
            "invalid exposed_count `{}` in report {id}",
            raw.exposed_count
        ))
    })?;

    let created_at = decode_timestamp(&raw.created_at).ok_or_else(|| {
        ReportError::InvalidData(format!(
            "invalid timestamp `{}` in reports.created_at",
            raw.created_at
        ))
    })?;
    let last_updated_at = decode_timestamp(&raw.last_updated_at).ok_or_else(|| {
        ReportError::InvalidData(format!(
            "invalid timestamp `{}` in reports.last_updated_at",
            raw.last_updated_at
        ))
    })?;

    let report = Report {
        id,
        owner,
        exposed_count,
        created_at,
        last_updated_at,
    };
    report.validate()?;
    Ok(report)
}

/// Busy/locked databases and I/O failures clear up on their own.
pub(crate) fn is_transient_sqlite_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
        ),
        _ => false,
    }
}

/// Extended result code of a constraint failure, if `err` is one.
fn sqlite_constraint_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Some(failure.extended_code)
        }
        _ => None,
    }
}

/// Whether `err` is a foreign key failure.
///
/// Immediate checks on insert report `SQLITE_CONSTRAINT_FOREIGNKEY`. An
/// `ON DELETE RESTRICT` action fires as `SQLITE_CONSTRAINT_TRIGGER` with the
/// same message.
pub(crate) fn is_foreign_key_failure(err: &rusqlite::Error) -> bool {
    match (sqlite_constraint_code(err), err) {
        (Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY), _) => true,
        (Some(ffi::SQLITE_CONSTRAINT_TRIGGER), rusqlite::Error::SqliteFailure(_, Some(message))) => {
            message.contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}

pub(crate) fn map_write_error(err: rusqlite::Error, owner: &Owner) -> ReportError {
    if is_foreign_key_failure(&err) {
        return ReportError::ForeignKeyViolation(*owner);
    }
    match sqlite_constraint_code(&err) {
        Some(ffi::SQLITE_CONSTRAINT_UNIQUE) => ReportError::DuplicateOwner(*owner),
        _ => err.into(),
    }
}

fn ensure_report_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(ReportError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [REPORTS_TABLE],
        |row| row.get(0),
    )?;
    if exists != 1 {
        return Err(ReportError::MissingRequiredTable(REPORTS_TABLE));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{is_foreign_key_failure, map_write_error};
    use crate::model::report::Owner;
    use crate::repo::ReportError;
    use rusqlite::ffi;

    fn constraint_failure(extended_code: i32, message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error::new(extended_code),
            Some(message.to_string()),
        )
    }

    #[test]
    fn restrict_trigger_failure_is_a_foreign_key_failure() {
        let restrict = constraint_failure(
            ffi::SQLITE_CONSTRAINT_TRIGGER,
            "FOREIGN KEY constraint failed",
        );
        assert!(is_foreign_key_failure(&restrict));

        let insert = constraint_failure(
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY,
            "FOREIGN KEY constraint failed",
        );
        assert!(is_foreign_key_failure(&insert));

        let other_trigger = constraint_failure(ffi::SQLITE_CONSTRAINT_TRIGGER, "custom abort");
        assert!(!is_foreign_key_failure(&other_trigger));
    }

    #[test]
    fn unique_failure_maps_to_duplicate_owner() {
        let owner = Owner::user("5b0f3c2e-8f4e-4d7a-9a51-0c6a7f3e2b10").unwrap();
        let err = constraint_failure(
            ffi::SQLITE_CONSTRAINT_UNIQUE,
            "UNIQUE constraint failed: reports.owner_user",
        );
        assert!(matches!(
            map_write_error(err, &owner),
            ReportError::DuplicateOwner(o) if o == owner
        ));
    }
}
