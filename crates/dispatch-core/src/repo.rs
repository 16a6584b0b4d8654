//! The schema boundary: every call the system makes into `schema.*` stored
//! procedures, plus the one write that bypasses them (§4.3, §6).
//!
//! Four of the five writes below go through a stored procedure so the
//! database can enforce the event-sourced lifecycle server-side; the fifth,
//! `no_machine_available`, is a direct `INSERT INTO schema.events` because the
//! dispatcher — not a client holding a job's authority — is the one raising
//! it, and no stored procedure exists for that actor. Still schema-qualified,
//! since every session runs with `search_path=''` (§4.2) and an unqualified
//! table name would simply fail to resolve. Asymmetry kept deliberately
//! rather than smoothed over with an extra procedure.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{from_row, Event};
use crate::model::Job;
use crate::pg::to_sql_array;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("{proc} returned {got} rows, expected exactly one")]
    WrongRowCount { proc: &'static str, got: usize },
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("decoding row from {proc}: {source}")]
    Decode {
        proc: &'static str,
        #[source]
        source: crate::error::FromRowError,
    },
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e)
    }
}

/// `SELECT schema.enqueue_job($1, $2, $3)`. Returns the new job id.
/// Mirrors the source's explicit row/field-count check rather than trusting
/// the driver to hand back exactly one scalar.
pub async fn enqueue_job(
    conn: &mut PgConnection,
    drv: &str,
    system: &str,
    required_features: &BTreeSet<String>,
) -> Result<Uuid, RepoError> {
    let rows = sqlx::query("SELECT schema.enqueue_job($1, $2, $3) AS job")
        .bind(drv)
        .bind(system)
        .bind(to_sql_array(required_features))
        .fetch_all(&mut *conn)
        .await?;

    one_row(rows, "enqueue_job")?
        .try_get::<Uuid, _>("job")
        .map_err(RepoError::from)
}

/// `SELECT schema.cancel_job($1)`.
pub async fn cancel_job(conn: &mut PgConnection, job: Uuid) -> Result<(), RepoError> {
    sqlx::query("SELECT schema.cancel_job($1)")
        .bind(job)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// `SELECT schema.accept_job($1, $2)`.
pub async fn accept_job(conn: &mut PgConnection, job: Uuid, uri: &str) -> Result<(), RepoError> {
    sqlx::query("SELECT schema.accept_job($1, $2)")
        .bind(job)
        .bind(uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// `SELECT schema.add_inputs_and_outputs($1, $2, $3)`.
pub async fn add_inputs_and_outputs(
    conn: &mut PgConnection,
    job: Uuid,
    inputs: &[String],
    wanted_outputs: &[String],
) -> Result<(), RepoError> {
    sqlx::query("SELECT schema.add_inputs_and_outputs($1, $2, $3)")
        .bind(job)
        .bind(to_sql_array(inputs))
        .bind(to_sql_array(wanted_outputs))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// `SELECT schema.get_job($1)`, re-reading a job with authority rather than
/// trusting a `start` event's payload (§4.5's matching algorithm).
pub async fn get_job(conn: &mut PgConnection, job: Uuid) -> Result<Job, RepoError> {
    let rows = sqlx::query("SELECT drv, system, required_features FROM schema.get_job($1)")
        .bind(job)
        .fetch_all(&mut *conn)
        .await?;

    let row = match rows.len() {
        1 => rows.into_iter().next().unwrap(),
        0 => return Err(RepoError::JobNotFound(job)),
        got => return Err(RepoError::WrongRowCount { proc: "get_job", got }),
    };

    let drv: String = row.try_get("drv")?;
    let system: String = row.try_get("system")?;
    let features: Vec<String> = row.try_get("required_features")?;

    Ok(Job {
        id: job,
        drv,
        system,
        required_features: features.into_iter().collect(),
    })
}

/// Direct `INSERT INTO events(ts, name, job, payload) VALUES (now(), 'no-machine-available', $1, '{}')`,
/// raised by the dispatcher rather than through a stored procedure (see
/// module docs).
pub async fn no_machine_available(conn: &mut PgConnection, job: Uuid) -> Result<(), RepoError> {
    sqlx::query(
        "INSERT INTO schema.events (ts, name, job, payload) VALUES (now(), 'no-machine-available', $1, '{}'::jsonb)",
    )
    .bind(job)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// `SELECT ... FROM schema.get_events($1)`, replaying every event for `job`
/// in `ts` order, for seeding an [`crate::stream::EventStream`] (§4.1).
pub async fn get_events(conn: &mut PgConnection, job: Uuid) -> Result<Vec<Event>, RepoError> {
    let rows = sqlx::query("SELECT ts, name, job, payload FROM schema.get_events($1)")
        .bind(job)
        .fetch_all(&mut *conn)
        .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let ts: DateTime<Utc> = row.try_get("ts")?;
        let name: String = row.try_get("name")?;
        let job: Uuid = row.try_get("job")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        events.push(
            from_row(Some(ts), Some(name), Some(job), Some(payload))
                .map_err(|source| RepoError::Decode {
                    proc: "get_events",
                    source,
                })?,
        );
    }
    Ok(events)
}

fn one_row(mut rows: Vec<sqlx::postgres::PgRow>, proc: &'static str) -> Result<sqlx::postgres::PgRow, RepoError> {
    if rows.len() != 1 {
        return Err(RepoError::WrongRowCount {
            proc,
            got: rows.len(),
        });
    }
    Ok(rows.remove(0))
}
