use exposure_store::db::open_db_in_memory;
use chrono::{TimeZone, Utc};
use exposure_store::{
    Dialect, ListPageQuery, Owner, OwnerDirectory, RepoResult, Report, ReportError, ReportId,
    ReportRepository, ReportService, RetryPolicy, SqliteOwnerDirectory, SqliteReportRepository,
};
use rusqlite::{ffi, Connection};
use std::cell::{Cell, RefCell};
use std::time::Duration;

const USER_ID: &str = "5b0f3c2e-8f4e-4d7a-9a51-0c6a7f3e2b10";

fn busy() -> ReportError {
    ReportError::from(rusqlite::Error::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_BUSY),
        None,
    ))
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
    }
}

/// Delegates to SQLite, failing the first `failures` writes as busy.
/// With `commit_before_failing`, a failed write still reaches the database.
struct FlakyRepository<'conn> {
    inner: SqliteReportRepository<'conn>,
    failures: Cell<u32>,
    commit_before_failing: bool,
    write_calls: Cell<u32>,
    page_limits: RefCell<Vec<u32>>,
}

impl<'conn> FlakyRepository<'conn> {
    fn new(conn: &'conn Connection, failures: u32, commit_before_failing: bool) -> Self {
        Self {
            inner: SqliteReportRepository::try_new(conn).unwrap(),
            failures: Cell::new(failures),
            commit_before_failing,
            write_calls: Cell::new(0),
            page_limits: RefCell::new(Vec::new()),
        }
    }

    fn flaky_write(&self, write: impl FnOnce() -> RepoResult<Report>) -> RepoResult<Report> {
        self.write_calls.set(self.write_calls.get() + 1);
        if self.failures.get() == 0 {
            return write();
        }
        self.failures.set(self.failures.get() - 1);
        if self.commit_before_failing {
            write()?;
        }
        Err(busy())
    }
}

impl ReportRepository for FlakyRepository<'_> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn create(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        self.flaky_write(|| self.inner.create(owner, count))
    }

    fn upsert(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        self.flaky_write(|| self.inner.upsert(owner, count))
    }

    fn get_by_owner(&self, owner: &Owner) -> RepoResult<Option<Report>> {
        self.inner.get_by_owner(owner)
    }

    fn get_by_id(&self, id: ReportId) -> RepoResult<Option<Report>> {
        self.inner.get_by_id(id)
    }

    fn delete(&self, owner: &Owner) -> RepoResult<bool> {
        self.inner.delete(owner)
    }

    fn delete_by_id(&self, id: ReportId) -> RepoResult<bool> {
        self.inner.delete_by_id(id)
    }

    fn list_since_page(&self, query: &ListPageQuery) -> RepoResult<Vec<Report>> {
        self.page_limits.borrow_mut().push(query.limit);
        self.inner.list_since_page(query)
    }

    fn count(&self) -> RepoResult<u64> {
        self.inner.count()
    }
}

fn setup() -> (Connection, Owner) {
    let conn = open_db_in_memory().unwrap();
    let owner = Owner::user(USER_ID).unwrap();
    SqliteOwnerDirectory::new(&conn).register(&owner).unwrap();
    (conn, owner)
}

#[test]
fn busy_error_is_classified_as_storage_unavailable() {
    let err = busy();
    assert!(matches!(err, ReportError::StorageUnavailable(_)));
    assert!(err.is_retryable());
}

#[test]
fn record_scan_retries_transient_failures() {
    let (conn, owner) = setup();
    let service = ReportService::with_retry(FlakyRepository::new(&conn, 2, false), fast_retry(3));

    let report = service.record_scan(&owner, 6).unwrap();
    assert_eq!(report.exposed_count, 6);
    assert_eq!(service.repository().write_calls.get(), 3);
    assert_eq!(service.report_for(&owner).unwrap(), Some(report));
}

#[test]
fn record_scan_gives_up_after_max_attempts() {
    let (conn, owner) = setup();
    let service = ReportService::with_retry(FlakyRepository::new(&conn, 5, false), fast_retry(2));

    let err = service.record_scan(&owner, 6).unwrap_err();
    assert!(matches!(err, ReportError::StorageUnavailable(_)));
    assert_eq!(service.repository().write_calls.get(), 2);
    assert!(service.report_for(&owner).unwrap().is_none());
}

#[test]
fn record_scan_does_not_retry_input_errors() {
    let (conn, owner) = setup();
    let service = ReportService::with_retry(FlakyRepository::new(&conn, 0, false), fast_retry(3));

    let err = service.record_scan(&owner, -4).unwrap_err();
    assert!(matches!(err, ReportError::InvalidCount(-4)));
    assert_eq!(service.repository().write_calls.get(), 1);
}

#[test]
fn retried_upsert_after_lost_reply_keeps_one_report() {
    let (conn, owner) = setup();
    let service = ReportService::with_retry(FlakyRepository::new(&conn, 1, true), fast_retry(3));

    let report = service.record_scan(&owner, 8).unwrap();
    assert_eq!(report.exposed_count, 8);
    assert_eq!(service.repository().count().unwrap(), 1);
}

#[test]
fn create_once_returns_report_committed_by_lost_attempt() {
    let (conn, owner) = setup();
    let service = ReportService::with_retry(FlakyRepository::new(&conn, 1, true), fast_retry(3));

    let report = service.create_once(&owner, 2).unwrap();
    assert_eq!(report.exposed_count, 2);
    assert_eq!(service.repository().write_calls.get(), 1);
    assert_eq!(service.repository().count().unwrap(), 1);
}

#[test]
fn purge_and_changed_since_go_through_repository() {
    let (conn, owner) = setup();
    let service = ReportService::new(SqliteReportRepository::try_new(&conn).unwrap());

    let recorded = service.record_scan(&owner, 1).unwrap();
    let changed: Vec<_> = service
        .changed_since(recorded.last_updated_at)
        .map(Result::unwrap)
        .collect();
    assert_eq!(changed, vec![recorded]);

    assert!(service.purge(&owner).unwrap());
    assert!(!service.purge(&owner).unwrap());
}

#[test]
fn changed_since_pages_with_service_page_size() {
    let conn = open_db_in_memory().unwrap();
    let directory = SqliteOwnerDirectory::new(&conn);
    let owners: Vec<_> = [
        "5b0f3c2e-8f4e-4d7a-9a51-0c6a7f3e2b10",
        "6c1a4d3f-9a5b-4e8c-8b62-1d7b8a4f3c21",
        "7d2b5e4a-0b6c-4f9d-9c73-2e8c9b5a4d32",
    ]
    .iter()
    .map(|id| Owner::user(id).unwrap())
    .collect();
    for owner in &owners {
        directory.register(owner).unwrap();
    }

    let service = ReportService::new(FlakyRepository::new(&conn, 0, false)).with_page_size(2);
    for (count, owner) in owners.iter().enumerate() {
        service.record_scan(owner, count as i64).unwrap();
    }

    let changed: Vec<_> = service
        .changed_since(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap())
        .map(Result::unwrap)
        .collect();
    assert_eq!(changed.len(), 3);
    assert_eq!(*service.repository().page_limits.borrow(), vec![2, 2]);
}

#[test]
fn changed_since_defaults_to_standard_page_size() {
    let (conn, owner) = setup();
    let service = ReportService::new(FlakyRepository::new(&conn, 0, false));
    let recorded = service.record_scan(&owner, 1).unwrap();

    let changed: Vec<_> = service
        .changed_since(recorded.last_updated_at)
        .map(Result::unwrap)
        .collect();
    assert_eq!(changed, vec![recorded]);
    assert_eq!(
        *service.repository().page_limits.borrow(),
        vec![exposure_store::repo::DEFAULT_PAGE_SIZE]
    );
}
