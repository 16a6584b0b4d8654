//! The per-worker runtime loop (§4.6).

use std::sync::Arc;

use dispatch_core::{fleet, pg, repo, ConnectionParams, Event, EventStream, RemoteStore};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::scheduler::{WorkerFatal, WorkerHandle};

/// Runs forever: wait for a job, build it, clear the inbox, repeat. Any
/// error escapes this loop and is reported to the fatal watcher — there is
/// no restart (§7: worker failures are always fatal to the queue process).
pub async fn run_worker(
    handle: Arc<WorkerHandle>,
    pg: ConnectionParams,
    store: Arc<dyn RemoteStore>,
    fatal_tx: mpsc::UnboundedSender<WorkerFatal>,
    verbose_job_logs: bool,
) {
    let store_uri = fleet::store_uri_with_params(&handle.machine, None);

    loop {
        let job_id = wait_for_job(&handle).await;

        if let Err(error) = run_job(&pg, store.as_ref(), &store_uri, job_id, verbose_job_logs).await {
            let _ = fatal_tx.send(WorkerFatal {
                store_uri: store_uri.clone(),
                error,
            });
            return;
        }

        *handle.inbox.lock().await = None;
    }
}

/// Creates the `Notified` future before checking the inbox so a
/// `notify_one` that lands between the check and the await is not lost.
async fn wait_for_job(handle: &WorkerHandle) -> Uuid {
    loop {
        let notified = handle.notify.notified();
        if let Some(job_id) = *handle.inbox.lock().await {
            return job_id;
        }
        notified.await;
    }
}

async fn run_job(
    pg: &ConnectionParams,
    store: &dyn RemoteStore,
    store_uri: &str,
    job_id: Uuid,
    verbose_job_logs: bool,
) -> anyhow::Result<()> {
    // LISTEN before accept: mandatory order so the worker cannot miss the
    // add-inputs-and-outputs event the enqueue side sends right after
    // seeing our accept (§4.6 step 3).
    let listener = pg::listen(pg, &job_id.to_string()).await?;
    let mut conn = pg::connect(pg).await?;

    let job = repo::get_job(&mut conn, job_id).await?;
    if verbose_job_logs {
        info!(job = %job_id, drv = %job.drv, system = %job.system, "resolved job");
    }
    repo::accept_job(&mut conn, job_id, store_uri).await?;
    info!(job = %job_id, machine = %store_uri, "accepted");

    let replay = repo::get_events(&mut conn, job_id).await?;
    let mut stream = EventStream::new(listener, job_id.to_string(), replay);

    let (inputs, wanted_outputs) = loop {
        match stream.next_event().await {
            Ok(Event::AddInputsAndOutputs {
                inputs,
                wanted_outputs,
                ..
            }) => break (inputs, wanted_outputs),
            Ok(_) => continue,
            Err(e) => return Err(e.into()),
        }
    };

    if verbose_job_logs {
        info!(job = %job_id, count = inputs.len(), "copying inputs to remote store");
    }
    store.copy_paths(store_uri, &inputs).await?;

    let input_srcs = store.input_srcs(&job.drv).await?;
    if !input_srcs.is_empty() && verbose_job_logs {
        info!(
            job = %job_id,
            count = input_srcs.len(),
            paths = ?input_srcs,
            "derivation carries input sources already placed on the remote store by the copy above"
        );
    } else if !input_srcs.is_empty() {
        debug!(
            job = %job_id,
            count = input_srcs.len(),
            "derivation carries input sources already placed on the remote store by the copy above"
        );
    }

    store.build_derivation(store_uri, &job.drv, &wanted_outputs).await?;
    info!(job = %job_id, "build finished");

    Ok(())
}
