//! Property 1 (replay completeness) and its race scenario S5: a consumer that
//! opens the stream after an event was already committed must still see it
//! exactly once, via the seeded replay, with no duplicate once the live side
//! catches up. Requires `PG_USER`/`PG_HOST`/`PG_PORT`/`PG_DBNAME` to point at
//! a live Postgres with a `schema.events` table (see `tests/common`).

mod common;

use dispatch_core::{pg, repo, Event, EventStream};
use serial_test::serial;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn replay_delivers_an_event_written_before_listen_started() {
    let (params, mut conn) = common::setup_db().await;
    let job = Uuid::new_v4();

    // The scenario itself: insert a `start` row directly (standing in for the
    // schema's `enqueue_job` procedure, which this core treats as opaque),
    // then open the stream *after* the insert has already committed. The
    // replay query (`get_events`) must still surface it exactly once.
    sqlx::query("INSERT INTO schema.events (name, job, payload) VALUES ('start', $1, $2::jsonb)")
        .bind(job)
        .bind(serde_json::json!({
            "drv": "/nix/store/aaa-foo.drv",
            "system": "x86_64-linux",
            "system_features": [],
        }))
        .execute(&mut conn)
        .await
        .unwrap();

    let listener = pg::listen(&params, &job.to_string()).await.unwrap();
    let replay = repo::get_events(&mut conn, job).await.unwrap();
    assert_eq!(replay.len(), 1);

    let mut stream = EventStream::new(listener, job.to_string(), replay);
    let first = stream.next_event().await.unwrap();
    assert!(matches!(first, Event::Start { job: j, .. } if j == job));

    // Now notify live, after the stream was already seeded; it must not be
    // replayed a second time, and the live notification must still surface.
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(job.to_string())
        .bind(
            serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "name": "no-machine-available",
                "job": job,
                "payload": {},
            })
            .to_string(),
        )
        .execute(&mut conn)
        .await
        .unwrap();

    let second = stream.next_event().await.unwrap();
    assert!(matches!(second, Event::NoMachineAvailable { job: j, .. } if j == job));
}

#[tokio::test]
#[serial]
async fn bad_notification_payload_is_reported_and_does_not_end_the_stream() {
    let (params, mut conn) = common::setup_db().await;
    let job = Uuid::new_v4();

    let listener = pg::listen(&params, &job.to_string()).await.unwrap();
    let mut stream = EventStream::new(listener, job.to_string(), Vec::new());

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(job.to_string())
        .bind("{not json")
        .execute(&mut conn)
        .await
        .unwrap();

    let err = stream.next_event().await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("{not json"));

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(job.to_string())
        .bind(
            serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "name": "cancel",
                "job": job,
                "payload": {},
            })
            .to_string(),
        )
        .execute(&mut conn)
        .await
        .unwrap();

    let next = stream.next_event().await.unwrap();
    assert!(matches!(next, Event::Cancel { job: j, .. } if j == job));
}
