//! Shared fixture for the handful of tests that need a real `LISTEN`/`NOTIFY`
//! channel rather than an in-memory one: connects to a live Postgres using
//! the same `PG_*` variables `dispatch_core::config::PgEnvConfig` already
//! reads, rather than a separate test-only connection string. This core
//! carries no migrations of its own — the target database must already have
//! a `schema.events` table shaped like the event rows the codec parses, plus
//! a `schema.get_events(uuid)` function `repo::get_events` calls through;
//! these tests only insert into, truncate, and replace that function.

use dispatch_core::{pg, PgEnvConfig};
use sqlx::{Executor, PgConnection};

/// Connects using the same `PG_USER`/`PG_HOST`/`PG_PORT`/`PG_DBNAME`
/// variables the `queue` and `enqueue` binaries read, truncates
/// `schema.events` so each test starts from a clean slate, and makes sure a
/// `schema.get_events(uuid)` function exists for `repo::get_events` to call.
pub async fn setup_db() -> (dispatch_core::ConnectionParams, PgConnection) {
    let cfg = PgEnvConfig::from_env().expect(
        "PG_USER/PG_HOST/PG_PORT/PG_DBNAME must point at a database with a schema.events table",
    );

    let mut conn = pg::connect(&cfg.params)
        .await
        .expect("connecting to test postgres");

    conn.execute("TRUNCATE TABLE schema.events")
        .await
        .expect("truncating schema.events");

    conn.execute(
        "CREATE OR REPLACE FUNCTION schema.get_events(job uuid) \
         RETURNS SETOF schema.events AS $$ \
         SELECT * FROM schema.events WHERE events.job = get_events.job ORDER BY ts ASC \
         $$ LANGUAGE sql STABLE",
    )
    .await
    .expect("creating schema.get_events");

    (cfg.params, conn)
}
