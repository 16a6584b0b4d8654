//! The enqueue binary: the nix build-hook side of the protocol (§4.4).
//!
//! Implements the hook handshake on top of the shared event stream:
//! read settings, read the try-token, read the build requirements, enqueue,
//! install best-effort cancellation, then follow the job's event stream to
//! a verdict and (if accepted) through to the inputs/outputs handoff.
//!
//! stderr is reserved for exactly the three protocol line shapes the driver
//! expects (§6); logging goes to stdout instead, which this protocol leaves
//! unused.

mod protocol;

use std::collections::BTreeSet;

use dispatch_core::{pg, repo, ConnectionParams, Event, EnqueueArgs, EventStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use protocol::{read_settings, read_string, read_string_set, read_u64};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = EnqueueArgs::parse(&argv)?;

    init_tracing(args.verbosity);

    let mut stdin = tokio::io::stdin();

    let _settings = read_settings(&mut stdin).await?;

    let token = read_string(&mut stdin).await?;
    if token != "try" {
        debug!("driver is not offering a try, exiting without output");
        return Ok(());
    }

    let am_willing = read_u64(&mut stdin).await?;
    let needed_system = read_string(&mut stdin).await?;
    let drv_path = read_string(&mut stdin).await?;
    let required_features: BTreeSet<String> = read_string_set(&mut stdin)
        .await?
        .into_iter()
        .collect();

    info!(
        drv = %drv_path,
        system = %needed_system,
        am_willing,
        features = ?required_features,
        "considering job"
    );

    let mut conn = pg::connect(&args.pg).await?;
    let job_id = repo::enqueue_job(&mut conn, &drv_path, &needed_system, &required_features).await?;
    info!(job = %job_id, "enqueued");

    spawn_cancel_on_interrupt(args.pg.clone(), job_id);

    // LISTEN before replay: mandatory order so nothing written between the
    // two is lost (§4.4 step 6).
    let listener = pg::listen(&args.pg, &job_id.to_string()).await?;
    let replay = repo::get_events(&mut conn, job_id).await?;
    let mut stream = EventStream::new(listener, job_id.to_string(), replay);

    let accept_uri = loop {
        match stream.next_event().await {
            Ok(Event::NoMachineAvailable { .. }) => {
                eprintln!("# decline-permanently");
                return Ok(());
            }
            Ok(Event::Accept { uri, .. }) => break uri,
            Ok(_) => continue,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "non-fatal error awaiting verdict, continuing");
                continue;
            }
        }
    };

    eprintln!("# accept");
    eprintln!("{accept_uri}");

    let inputs = read_string_set(&mut stdin).await?;
    let wanted_outputs = read_string_set(&mut stdin).await?;
    repo::add_inputs_and_outputs(&mut conn, job_id, &inputs, &wanted_outputs).await?;

    // Keep following the stream after handing off inputs/outputs, rather
    // than the source's unconditional `while (true) {}`: a `fail` event
    // ends the hook with an error, and the stream simply running dry once
    // the job completes is treated as implicit success — the driver has
    // already gotten its verdict, there is nothing further for it to wait
    // on.
    loop {
        match stream.next_event().await {
            Ok(Event::Fail { msg, .. }) => anyhow::bail!("build failed: {msg}"),
            Ok(_) => continue,
            Err(e) if e.is_fatal() => {
                debug!(error = %e, "event stream ended, treating as implicit success");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "non-fatal error on event stream, continuing");
                continue;
            }
        }
    }
}

/// Registers a best-effort cancellation handler (§4.4 step 5, §7): on
/// Ctrl-C/SIGTERM, publish `cancel` on a fresh connection. The process may
/// still die before the notify completes, as the source's own signal
/// handler can.
fn spawn_cancel_on_interrupt(pg: ConnectionParams, job_id: Uuid) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        match pg::connect(&pg).await {
            Ok(mut conn) => {
                if let Err(e) = repo::cancel_job(&mut conn, job_id).await {
                    error!(job = %job_id, error = %e, "failed to publish cancel");
                }
            }
            Err(e) => error!(job = %job_id, error = %e, "failed to connect for cancel"),
        }
    });
}

fn init_tracing(verbosity: i32) {
    let level = match verbosity {
        v if v <= 0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stdout)
        .init();
}
