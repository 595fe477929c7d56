//! Client bootstrap for PostgreSQL.
//!
//! # Invariants
//! - Returned clients have migrations fully applied.
//! - Sessions run with `TimeZone = 'UTC'` so server-side rendering of
//!   `TIMESTAMPTZ` never depends on server locale.

use super::migrations::apply_postgres_migrations;
use super::schema::OwnerDeletePolicy;
use super::{DbError, DbResult};
use log::{error, info};
use postgres::{Client, NoTls};
use std::time::Instant;

/// Connects to PostgreSQL and applies all pending migrations.
///
/// `url` accepts either a `postgres://` URL or a key/value connection
/// string.
pub fn connect_postgres(url: &str, policy: OwnerDeletePolicy) -> DbResult<Client> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start backend=postgres");

    let result: DbResult<Client> = Client::connect(url, NoTls)
        .map_err(DbError::from)
        .and_then(|mut client| {
            client.batch_execute("SET TIME ZONE 'UTC';")?;
            apply_postgres_migrations(&mut client, policy)?;
            Ok(client)
        });

    match &result {
        Ok(_) => info!(
            "event=db_open module=db status=ok backend=postgres duration_ms={}",
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error backend=postgres duration_ms={} error_code=db_bootstrap_failed error={}",
            started_at.elapsed().as_millis(),
            err
        ),
    }
    result
}
