//! Report repository, PostgreSQL implementation.
//!
//! # Responsibility
//! - Provide the report contract over native `UUID` / `TIMESTAMPTZ` columns.
//! - Expose the same canonical types as the SQLite implementation.
//!
//! # Invariants
//! - One client per repository, locked for the duration of one operation.
//! - Every write runs in its own transaction; dropping it rolls back.
//! - `upsert` is a single `INSERT .. ON CONFLICT .. DO UPDATE` statement.
//!   The new `last_updated_at` is computed while the row lock is held and is
//!   at least one microsecond past the stored value, so timestamp order
//!   follows commit order and count and timestamp come from the same call.

use super::directory::PostgresOwnerDirectory;
use super::{log_outcome, ListPageQuery, RepoResult, ReportError, ReportRepository};
use crate::db::codec::ceil_to_micros;
use crate::db::pg::connect_postgres;
use crate::db::schema::OwnerDeletePolicy;
use crate::db::{DbResult, Dialect};
use crate::model::report::{validate_count, Owner, OwnerKind, Report, ReportId};
use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{Client, Row};
use std::error::Error;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use uuid::Uuid;

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
) VALUES ($1, $2, $3, $4, $5, $5)
RETURNING id, owner_user, owner_org, exposed_count, created_at, last_updated_at";

const UPSERT_USER_SQL: &str = "INSERT INTO reports (
    id,
    owner_user,
    owner_org,
    exposed_count,
    created_at,
    last_updated_at
) VALUES ($1, $2, $3, $4, $5, $5)
ON CONFLICT (owner_user) WHERE owner_user IS NOT NULL DO UPDATE SET
    exposed_count = EXCLUDED.exposed_count,
    last_updated_at = GREATEST(
        reports.last_updated_at + INTERVAL '1 microsecond',
        EXCLUDED.last_updated_at
    )
RETURNING id, owner_user, owner_org, exposed_count, created_at, last_updated_at";

const UPSERT_ORG_SQL: &str = "INSERT INTO reports (
    id,
    owner_user,
    owner_org,
    exposed_count,
    created_at,
    last_updated_at
) VALUES ($1, $2, $3, $4, $5, $5)
ON CONFLICT (owner_org) WHERE owner_org IS NOT NULL DO UPDATE SET
    exposed_count = EXCLUDED.exposed_count,
    last_updated_at = GREATEST(
        reports.last_updated_at + INTERVAL '1 microsecond',
        EXCLUDED.last_updated_at
    )
RETURNING id, owner_user, owner_org, exposed_count, created_at, last_updated_at";

/// PostgreSQL-backed report repository.
///
/// Shareable across threads; operations on one repository serialize on its
/// client. Workers that need parallel writes open one repository each.
pub struct PostgresReportRepository {
    client: Mutex<Client>,
    clock: fn() -> DateTime<Utc>,
}

impl PostgresReportRepository {
    /// Connects, applies migrations and wraps the client.
    pub fn connect(url: &str, policy: OwnerDeletePolicy) -> DbResult<Self> {
        Ok(Self::from_client(connect_postgres(url, policy)?))
    }

    /// Wraps an already migrated client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
            clock: Utc::now,
        }
    }

    /// Replaces the wall clock used to stamp writes.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Owner directory sharing this repository's client.
    pub fn directory(&self) -> PostgresOwnerDirectory<'_> {
        PostgresOwnerDirectory::new(&self.client)
    }

    fn lock(&self) -> MutexGuard<'_, Client> {
        lock_client(&self.client)
    }

    fn write_returning(&self, sql: &str, owner: &Owner, count: u32) -> RepoResult<Report> {
        let stored_count =
            i32::try_from(count).map_err(|_| ReportError::InvalidCount(i64::from(count)))?;

        let mut client = self.lock();
        let mut tx = client.transaction()?;
        let report = Report::new(*owner, i64::from(count), (self.clock)())?;
        let (owner_user, owner_org) = report.owner.to_columns();
        let row = tx
            .query_one(
                sql,
                &[
                    &report.id.as_uuid(),
                    &owner_user,
                    &owner_org,
                    &stored_count,
                    &report.created_at,
                ],
            )
            .map_err(|err| map_write_error(err, owner))?;
        let stored = decode_report(&row)?;
        tx.commit()?;
        Ok(stored)
    }

    fn delete_where(&self, column: &'static str, value: Uuid) -> RepoResult<bool> {
        let mut client = self.lock();
        let sql = format!("DELETE FROM reports WHERE {column} = $1");
        let changed = client.execute(sql.as_str(), &[&value])?;
        Ok(changed > 0)
    }

    fn query_optional(&self, column: &'static str, value: Uuid) -> RepoResult<Option<Report>> {
        let mut client = self.lock();
        let sql = format!("{REPORT_SELECT_SQL} WHERE {column} = $1");
        let row = client.query_opt(sql.as_str(), &[&value])?;
        row.as_ref().map(decode_report).transpose()
    }
}

impl ReportRepository for PostgresReportRepository {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn create(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        let started_at = Instant::now();
        let result = validate_count(count)
            .map_err(ReportError::from)
            .and_then(|count| self.write_returning(INSERT_SQL, owner, count));
        log_outcome("report_create", Dialect::Postgres, Some(owner), started_at, &result);
        result
    }

    fn upsert(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        let started_at = Instant::now();
        let sql = match owner.kind() {
            OwnerKind::User => UPSERT_USER_SQL,
            OwnerKind::Organization => UPSERT_ORG_SQL,
        };
        let result = validate_count(count)
            .map_err(ReportError::from)
            .and_then(|count| self.write_returning(sql, owner, count));
        log_outcome("report_upsert", Dialect::Postgres, Some(owner), started_at, &result);
        result
    }

    fn get_by_owner(&self, owner: &Owner) -> RepoResult<Option<Report>> {
        self.query_optional(owner.kind().column(), owner.as_uuid())
    }

    fn get_by_id(&self, id: ReportId) -> RepoResult<Option<Report>> {
        self.query_optional("id", id.as_uuid())
    }

    fn delete(&self, owner: &Owner) -> RepoResult<bool> {
        let started_at = Instant::now();
        let result = self.delete_where(owner.kind().column(), owner.as_uuid());
        log_outcome("report_delete", Dialect::Postgres, Some(owner), started_at, &result);
        result
    }

    fn delete_by_id(&self, id: ReportId) -> RepoResult<bool> {
        let started_at = Instant::now();
        let result = self.delete_where("id", id.as_uuid());
        log_outcome("report_delete", Dialect::Postgres, None, started_at, &result);
        result
    }

    fn list_since_page(&self, query: &ListPageQuery) -> RepoResult<Vec<Report>> {
        let since = ceil_to_micros(query.since);
        let limit = i64::from(query.limit);
        let after = query
            .after
            .map(|cursor| (cursor.last_updated_at, cursor.id.as_uuid()));

        let mut sql = format!("{REPORT_SELECT_SQL} WHERE last_updated_at >= $1");
        let mut bind_values: Vec<&(dyn ToSql + Sync)> = vec![&since];

        if let Some(until) = query.until.as_ref() {
            bind_values.push(until);
            sql.push_str(&format!(" AND last_updated_at <= ${}", bind_values.len()));
        }

        if let Some((after_ts, after_id)) = after.as_ref() {
            bind_values.push(after_ts);
            let ts_param = bind_values.len();
            bind_values.push(after_id);
            let id_param = bind_values.len();
            sql.push_str(&format!(
                " AND (last_updated_at > ${ts_param} OR (last_updated_at = ${ts_param} AND id > ${id_param}))"
            ));
        }

        bind_values.push(&limit);
        sql.push_str(&format!(
            " ORDER BY last_updated_at ASC, id ASC LIMIT ${}",
            bind_values.len()
        ));

        let mut client = self.lock();
        let rows = client.query(sql.as_str(), &bind_values)?;
        rows.iter().map(decode_report).collect()
    }

    fn count(&self) -> RepoResult<u64> {
        let mut client = self.lock();
        let row = client.query_one("SELECT COUNT(*) FROM reports", &[])?;
        let count: i64 = row.try_get(0)?;
        u64::try_from(count)
            .map_err(|_| ReportError::InvalidData(format!("negative row count {count}")))
    }
}

/// A panic while holding the lock leaves no open transaction behind: the
/// transaction guard rolled back during unwind. The client is still usable.
pub(crate) fn lock_client(client: &Mutex<Client>) -> MutexGuard<'_, Client> {
    client.lock().unwrap_or_else(PoisonError::into_inner)
}

fn decode_report(row: &Row) -> RepoResult<Report> {
    let id: Uuid = row.try_get("id")?;
    let owner_user: Option<Uuid> = row.try_get("owner_user")?;
    let owner_org: Option<Uuid> = row.try_get("owner_org")?;
    let exposed_count: i32 = row.try_get("exposed_count")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let last_updated_at: DateTime<Utc> = row.try_get("last_updated_at")?;

    let id = ReportId::from_uuid(id);
    let owner = Owner::from_uuid_columns(owner_user, owner_org)
        .map_err(|err| ReportError::InvalidData(format!("report {id}: {err}")))?;
    let exposed_count = u32::try_from(exposed_count).map_err(|_| {
        ReportError::InvalidData(format!(
            "invalid exposed_count `{exposed_count}` in report {id}"
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

/// Connection loss, admin shutdown, serialization failures and deadlocks
/// are worth retrying; everything else is not.
pub(crate) fn is_transient_postgres_error(err: &postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        Some(code) => {
            code.code().starts_with("08")
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::TOO_MANY_CONNECTIONS
        }
        // No server error code: the failure happened on the wire.
        None => err
            .source()
            .is_some_and(|source| source.is::<std::io::Error>()),
    }
}

pub(crate) fn map_write_error(err: postgres::Error, owner: &Owner) -> ReportError {
    match err.code() {
        Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
            ReportError::ForeignKeyViolation(*owner)
        }
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => ReportError::DuplicateOwner(*owner),
        _ => err.into(),
    }
}
