//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the report data-access contract shared by both backends.
//! - Isolate SQL details from service orchestration.
//! - Classify backend failures into the report error taxonomy.
//!
//! # Invariants
//! - Writes validate owner and count before any SQL runs.
//! - Not-found is `Ok(None)` / `Ok(false)`, never an error.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::{DbError, Dialect};
use crate::model::report::{Owner, Report, ReportId, ReportValidationError};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

pub mod directory;
pub mod postgres_repo;
pub mod report_repo;

/// Default number of rows fetched per `list_since` page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

pub type RepoResult<T> = Result<T, ReportError>;

/// Failure taxonomy for report operations.
#[derive(Debug)]
pub enum ReportError {
    /// Owner reference is absent, ambiguous or malformed.
    InvalidOwner(String),
    /// Count is negative or out of the stored range.
    InvalidCount(i64),
    /// The referenced owner does not exist, or still has a report
    /// attached when the owner itself is removed.
    ForeignKeyViolation(Owner),
    /// `create` found an existing report for this owner.
    DuplicateOwner(Owner),
    /// Transient backend failure. Safe to retry `upsert`.
    StorageUnavailable(DbError),
    /// Any other backend failure.
    Db(DbError),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Persisted data cannot be converted to a valid report.
    InvalidData(String),
}

impl ReportError {
    /// Whether retrying the same call can succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl Display for ReportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOwner(message) => write!(f, "invalid owner: {message}"),
            Self::InvalidCount(count) => write!(f, "invalid exposed count: {count}"),
            Self::ForeignKeyViolation(owner) => {
                write!(f, "foreign key violation for owner {owner}")
            }
            Self::DuplicateOwner(owner) => write!(f, "report already exists for owner {owner}"),
            Self::StorageUnavailable(err) => write!(f, "storage unavailable: {err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "report repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "report repository requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted report data: {message}"),
        }
    }
}

impl Error for ReportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StorageUnavailable(err) | Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ReportValidationError> for ReportError {
    fn from(value: ReportValidationError) -> Self {
        match value {
            ReportValidationError::InvalidOwner(message) => Self::InvalidOwner(message),
            ReportValidationError::InvalidCount(count) => Self::InvalidCount(count),
            ReportValidationError::InvalidId(value) => {
                Self::InvalidData(format!("invalid identifier `{value}`"))
            }
            ReportValidationError::TimestampOrder => {
                Self::InvalidData("last_updated_at precedes created_at".to_string())
            }
        }
    }
}

impl From<DbError> for ReportError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => err.into(),
            DbError::Postgres(err) => err.into(),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for ReportError {
    fn from(value: rusqlite::Error) -> Self {
        if report_repo::is_transient_sqlite_error(&value) {
            Self::StorageUnavailable(DbError::Sqlite(value))
        } else {
            Self::Db(DbError::Sqlite(value))
        }
    }
}

impl From<postgres::Error> for ReportError {
    fn from(value: postgres::Error) -> Self {
        if postgres_repo::is_transient_postgres_error(&value) {
            Self::StorageUnavailable(DbError::Postgres(value))
        } else {
            Self::Db(DbError::Postgres(value))
        }
    }
}

/// Emits one metadata-only `event=report_*` line for a finished operation.
pub(crate) fn log_outcome<T>(
    event: &'static str,
    dialect: Dialect,
    owner: Option<&Owner>,
    started_at: Instant,
    result: &RepoResult<T>,
) {
    let owner = owner.map_or_else(|| "-".to_string(), Owner::to_string);
    let duration_ms = started_at.elapsed().as_millis();
    match result {
        Ok(_) => debug!(
            "event={event} module=repo status=ok backend={dialect} owner={owner} duration_ms={duration_ms}"
        ),
        Err(err @ ReportError::StorageUnavailable(_)) => warn!(
            "event={event} module=repo status=retryable backend={dialect} owner={owner} duration_ms={duration_ms} error={err}"
        ),
        Err(err) => warn!(
            "event={event} module=repo status=error backend={dialect} owner={owner} duration_ms={duration_ms} error={err}"
        ),
    }
}

/// Keyset position inside the `list_since` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListCursor {
    pub last_updated_at: DateTime<Utc>,
    pub id: ReportId,
}

impl ListCursor {
    pub fn after(report: &Report) -> Self {
        Self {
            last_updated_at: report.last_updated_at,
            id: report.id,
        }
    }
}

/// One page of a `list_since` scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPageQuery {
    /// Inclusive lower bound on `last_updated_at`.
    pub since: DateTime<Utc>,
    /// Inclusive upper bound on `last_updated_at`. Bounds the scan so it
    /// terminates while writers keep advancing timestamps.
    pub until: Option<DateTime<Utc>>,
    /// Return rows strictly after this position.
    pub after: Option<ListCursor>,
    pub limit: u32,
}

/// Repository interface for exposure reports.
pub trait ReportRepository {
    /// Backend family serving this repository.
    fn dialect(&self) -> Dialect;

    /// Inserts a new report for `owner`.
    fn create(&self, owner: &Owner, count: i64) -> RepoResult<Report>;

    /// Inserts or updates the owner's report in one atomic write.
    fn upsert(&self, owner: &Owner, count: i64) -> RepoResult<Report>;

    fn get_by_owner(&self, owner: &Owner) -> RepoResult<Option<Report>>;

    fn get_by_id(&self, id: ReportId) -> RepoResult<Option<Report>>;

    /// Removes the owner's report. Returns whether a row was removed.
    fn delete(&self, owner: &Owner) -> RepoResult<bool>;

    /// Removes a report by id. Returns whether a row was removed.
    fn delete_by_id(&self, id: ReportId) -> RepoResult<bool>;

    /// Reads one keyset page ordered by `(last_updated_at, id)` ascending.
    fn list_since_page(&self, query: &ListPageQuery) -> RepoResult<Vec<Report>>;

    fn count(&self) -> RepoResult<u64>;

    /// Lazily streams reports updated at or after `since`.
    fn list_since(&self, since: DateTime<Utc>) -> ReportStream<'_>
    where
        Self: Sized,
    {
        ReportStream::new(self, since)
    }
}

macro_rules! forward_report_repository {
    ($($target:ty),+) => {$(
        impl<R: ReportRepository + ?Sized> ReportRepository for $target {
            fn dialect(&self) -> Dialect {
                (**self).dialect()
            }

            fn create(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
                (**self).create(owner, count)
            }

            fn upsert(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
                (**self).upsert(owner, count)
            }

            fn get_by_owner(&self, owner: &Owner) -> RepoResult<Option<Report>> {
                (**self).get_by_owner(owner)
            }

            fn get_by_id(&self, id: ReportId) -> RepoResult<Option<Report>> {
                (**self).get_by_id(id)
            }

            fn delete(&self, owner: &Owner) -> RepoResult<bool> {
                (**self).delete(owner)
            }

            fn delete_by_id(&self, id: ReportId) -> RepoResult<bool> {
                (**self).delete_by_id(id)
            }

            fn list_since_page(&self, query: &ListPageQuery) -> RepoResult<Vec<Report>> {
                (**self).list_since_page(query)
            }

            fn count(&self) -> RepoResult<u64> {
                (**self).count()
            }
        }
    )+};
}

forward_report_repository!(Box<R>, &R);

/// Lazy, finite, restartable scan over reports changed since a point in time.
///
/// Pages are fetched on demand. The scan is bounded above by the instant it
/// was started, so it ends even while writers keep touching reports. A
/// consumer can stop at any point, keep [`ReportStream::cursor`], and resume
/// later with [`ReportStream::resume`].
pub struct ReportStream<'a> {
    repo: &'a (dyn ReportRepository + 'a),
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    cursor: Option<ListCursor>,
    page_size: u32,
    buffer: VecDeque<Report>,
    exhausted: bool,
}

impl<'a> ReportStream<'a> {
    pub fn new(repo: &'a (dyn ReportRepository + 'a), since: DateTime<Utc>) -> Self {
        Self::resume(repo, since, Utc::now(), None)
    }

    /// Continues a scan after `cursor` with the original bounds.
    pub fn resume(
        repo: &'a (dyn ReportRepository + 'a),
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        cursor: Option<ListCursor>,
    ) -> Self {
        Self {
            repo,
            since,
            until,
            cursor,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Page size for subsequent fetches. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }

    /// Position of the last report handed out.
    pub fn cursor(&self) -> Option<ListCursor> {
        self.cursor
    }

    fn fill(&mut self) -> RepoResult<()> {
        let page = self.repo.list_since_page(&ListPageQuery {
            since: self.since,
            until: Some(self.until),
            after: self.cursor,
            limit: self.page_size,
        })?;
        if page.len() < self.page_size as usize {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for ReportStream<'_> {
    type Item = RepoResult<Report>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let report = self.buffer.pop_front()?;
        self.cursor = Some(ListCursor::after(&report));
        Some(Ok(report))
    }
}
