//! Exposure report use-case service.
//!
//! # Responsibility
//! - Provide the entry points the exposure scanner and reporting callers use.
//! - Retry transient storage failures with bounded exponential backoff.
//!
//! # Invariants
//! - Only `StorageUnavailable` is retried; input and referential errors are
//!   returned on the first attempt.
//! - `create_once` re-checks for an existing report before every retry, so
//!   a create that committed but lost its reply is not inserted twice.

use crate::model::report::{Owner, Report};
use crate::repo::{RepoResult, ReportRepository, ReportStream, DEFAULT_PAGE_SIZE};
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::time::Duration;

/// Backoff settings for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Use-case service wrapper for report operations.
pub struct ReportService<R: ReportRepository> {
    repo: R,
    retry: RetryPolicy,
    page_size: u32,
}

impl<R: ReportRepository> ReportService<R> {
    pub fn new(repo: R) -> Self {
        Self::with_retry(repo, RetryPolicy::default())
    }

    pub fn with_retry(repo: R, retry: RetryPolicy) -> Self {
        Self {
            repo,
            retry,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size used by `changed_since`. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Records the outcome of one scan cycle for `owner`.
    ///
    /// # Contract
    /// - Creates the report on first scan, updates it afterwards.
    /// - Retries transient storage failures; upsert is idempotent.
    pub fn record_scan(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        let mut attempt = 1;
        loop {
            match self.repo.upsert(owner, count) {
                Ok(report) => {
                    info!(
                        "event=scan_recorded module=service status=ok owner={} count={} attempts={}",
                        owner, report.exposed_count, attempt
                    );
                    return Ok(report);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    self.back_off("scan_recorded", owner, attempt, &err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates the owner's first report, tolerating transient failures.
    ///
    /// If a retry finds that an earlier attempt (or another writer) already
    /// stored a report, that report is returned instead.
    pub fn create_once(&self, owner: &Owner, count: i64) -> RepoResult<Report> {
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                if let Some(existing) = self.repo.get_by_owner(owner)? {
                    return Ok(existing);
                }
            }

            match self.repo.create(owner, count) {
                Ok(report) => return Ok(report),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    self.back_off("report_create", owner, attempt, &err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Current report for `owner`, if one exists.
    pub fn report_for(&self, owner: &Owner) -> RepoResult<Option<Report>> {
        self.repo.get_by_owner(owner)
    }

    /// Removes the owner's report. Missing reports are not an error.
    pub fn purge(&self, owner: &Owner) -> RepoResult<bool> {
        self.repo.delete(owner)
    }

    /// Reports changed at or after `since`, oldest change first.
    pub fn changed_since(&self, since: DateTime<Utc>) -> ReportStream<'_> {
        ReportStream::new(&self.repo, since).with_page_size(self.page_size)
    }

    fn back_off(
        &self,
        event: &'static str,
        owner: &Owner,
        attempt: u32,
        err: &crate::repo::ReportError,
    ) {
        let delay = self.retry.delay_after(attempt);
        warn!(
            "event={} module=service status=retry owner={} attempt={} delay_ms={} error={}",
            event,
            owner,
            attempt,
            delay.as_millis(),
            err
        );
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
    }
}
