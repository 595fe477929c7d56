use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use exposure_store::db::open_db_in_memory;
use exposure_store::{
    ListCursor, ListPageQuery, Owner, OwnerDirectory, Report, ReportRepository, ReportStream,
    SqliteOwnerDirectory, SqliteReportRepository,
};
use rusqlite::Connection;

const OWNERS: [&str; 4] = [
    "10000000-0000-4000-8000-000000000001",
    "10000000-0000-4000-8000-000000000002",
    "10000000-0000-4000-8000-000000000003",
    "10000000-0000-4000-8000-000000000004",
];

fn t(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
}

fn at_0() -> DateTime<Utc> {
    t(0)
}

fn at_10() -> DateTime<Utc> {
    t(10)
}

fn at_20() -> DateTime<Utc> {
    t(20)
}

fn at_30() -> DateTime<Utc> {
    t(30)
}

fn owners() -> Vec<Owner> {
    OWNERS.iter().map(|id| Owner::user(id).unwrap()).collect()
}

/// Four reports last updated at minutes 10, 20, 20 and 30.
fn seeded() -> Connection {
    let conn = open_db_in_memory().unwrap();
    let directory = SqliteOwnerDirectory::new(&conn);
    for owner in owners() {
        directory.register(&owner).unwrap();
    }

    let owners = owners();
    let writes: [(fn() -> DateTime<Utc>, usize); 4] =
        [(at_10, 0), (at_20, 1), (at_20, 2), (at_30, 3)];
    for (clock, index) in writes {
        SqliteReportRepository::try_new(&conn)
            .unwrap()
            .with_clock(clock)
            .upsert(&owners[index], index as i64)
            .unwrap();
    }
    conn
}

fn collect(stream: ReportStream<'_>) -> Vec<Report> {
    stream.map(Result::unwrap).collect()
}

#[test]
fn lists_reports_at_or_after_since_in_update_order() {
    let conn = seeded();
    let repo = SqliteReportRepository::try_new(&conn).unwrap();

    let listed = collect(repo.list_since(t(20)));
    let times: Vec<_> = listed.iter().map(|r| r.last_updated_at).collect();
    assert_eq!(times, vec![t(20), t(20), t(30)]);
    assert!(listed[0].id < listed[1].id);

    assert_eq!(collect(repo.list_since(t(0))).len(), 4);
    assert!(collect(repo.list_since(t(31))).is_empty());
}

#[test]
fn sub_microsecond_since_does_not_include_earlier_rows() {
    let conn = seeded();
    let repo = SqliteReportRepository::try_new(&conn).unwrap();

    let since = t(20) + TimeDelta::nanoseconds(1);
    let listed = collect(repo.list_since(since));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_updated_at, t(30));
}

#[test]
fn small_pages_yield_every_report_exactly_once() {
    let conn = seeded();
    let repo = SqliteReportRepository::try_new(&conn).unwrap();

    let paged = collect(ReportStream::new(&repo, t(0)).with_page_size(1));
    let whole = collect(ReportStream::new(&repo, t(0)).with_page_size(100));
    assert_eq!(paged, whole);
    assert_eq!(paged.len(), 4);
}

#[test]
fn stream_can_stop_and_resume_from_cursor() {
    let conn = seeded();
    let repo = SqliteReportRepository::try_new(&conn).unwrap();

    let mut stream = ReportStream::new(&repo, t(0)).with_page_size(2);
    let first = stream.next().unwrap().unwrap();
    let second = stream.next().unwrap().unwrap();
    let cursor = stream.cursor().unwrap();
    assert_eq!(cursor, ListCursor::after(&second));
    let (since, until) = (stream.since(), stream.until());
    drop(stream);

    let rest = collect(ReportStream::resume(&repo, since, until, Some(cursor)));
    assert_eq!(rest.len(), 2);
    assert!(rest.iter().all(|r| r.id != first.id && r.id != second.id));
}

#[test]
fn stream_upper_bound_excludes_later_updates() {
    let conn = seeded();
    let repo = SqliteReportRepository::try_new(&conn).unwrap();

    let page = repo
        .list_since_page(&ListPageQuery {
            since: t(0),
            until: Some(t(20)),
            after: None,
            limit: 10,
        })
        .unwrap();
    assert_eq!(page.len(), 3);

    let stream = ReportStream::resume(&repo, t(0), t(25), None);
    let owners = owners();
    SqliteReportRepository::try_new(&conn)
        .unwrap()
        .with_clock(at_30)
        .upsert(&owners[0], 99)
        .unwrap();
    let listed = collect(stream);
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.owner != owners[0]));
}

#[test]
fn empty_store_lists_nothing() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteReportRepository::try_new(&conn).unwrap();

    assert!(collect(repo.list_since(at_0())).is_empty());
}
