//! The fleet scheduler: the listener, dispatcher, and fatal-watcher tasks
//! (§4.5).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dispatch_core::{fleet, pg, repo, ConnectionParams, Event, EventStream, EventStreamError, Machine};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One fleet machine paired with its inbox. A non-empty inbox means the
/// worker is busy; the scheduler never blocks waiting for one to clear
/// (§4.5's matching algorithm, §5's shared-resource policy).
pub struct WorkerHandle {
    pub machine: Machine,
    pub inbox: Mutex<Option<Uuid>>,
    pub notify: Notify,
}

/// Builds one handle per machine, in the machines' (already priority-sorted)
/// order — the dispatcher scans this vec in order, so sorting happens once
/// at startup rather than per dispatch.
pub fn build_workers(machines: Vec<Machine>) -> Vec<Arc<WorkerHandle>> {
    machines
        .into_iter()
        .map(|machine| {
            Arc::new(WorkerHandle {
                machine,
                inbox: Mutex::new(None),
                notify: Notify::new(),
            })
        })
        .collect()
}

pub type EventResult = Result<Event, EventStreamError>;

/// Listens on the global `events` channel and forwards every yielded
/// `Event`/error to the dispatcher's buffer, in the channel's own order
/// (§4.5 step 1, §5's ordering guarantee).
pub async fn run_listener(
    pg: ConnectionParams,
    tx: mpsc::UnboundedSender<EventResult>,
) -> anyhow::Result<()> {
    let listener = pg::listen(&pg, "events").await?;
    let mut stream = EventStream::new(listener, "events", Vec::new());

    loop {
        let result = stream.next_event().await;
        let fatal = matches!(&result, Err(e) if e.is_fatal());
        if tx.send(result).is_err() {
            return Ok(());
        }
        if fatal {
            return Ok(());
        }
    }
}

/// Pops events off the buffer and dispatches `start`s; everything else is
/// per-job chatter ignored at this scope, except `cancel`, which is
/// remembered so a start that raced it can still be caught (§4.5 step 2, §9).
pub async fn run_dispatcher(
    pg: ConnectionParams,
    mut rx: mpsc::UnboundedReceiver<EventResult>,
    workers: Arc<Vec<Arc<WorkerHandle>>>,
) -> anyhow::Result<()> {
    let mut cancelled: HashSet<Uuid> = HashSet::new();
    let mut pending: VecDeque<EventResult> = VecDeque::new();

    loop {
        let event_result = match pending.pop_front() {
            Some(ev) => ev,
            None => match rx.recv().await {
                Some(ev) => ev,
                None => return Ok(()),
            },
        };

        let event = match event_result {
            Ok(event) => event,
            Err(e) if e.is_fatal() => {
                anyhow::bail!("fatal error on the global event stream: {e}");
            }
            Err(e) => {
                warn!(error = %e, "transient error on the global event stream, continuing");
                continue;
            }
        };

        if let Event::Cancel { job, .. } = &event {
            cancelled.insert(*job);
            continue;
        }

        let Event::Start { job, .. } = event else {
            continue;
        };

        // Drain anything already sitting in the buffer before committing to
        // a dispatch: a cancel for this exact job may have already landed
        // behind the start while the dispatcher was busy scanning workers.
        // Everything drained still gets processed afterward, in order.
        while let Ok(ev) = rx.try_recv() {
            if let Ok(Event::Cancel { job: cancelled_job, .. }) = &ev {
                cancelled.insert(*cancelled_job);
            }
            pending.push_back(ev);
        }

        if cancelled.remove(&job) {
            info!(job = %job, "start raced a cancel, skipping dispatch");
            continue;
        }

        dispatch_start(&pg, &workers, job).await;
    }
}

async fn dispatch_start(pg: &ConnectionParams, workers: &[Arc<WorkerHandle>], job_id: Uuid) {
    let mut conn = match pg::connect(pg).await {
        Ok(c) => c,
        Err(e) => {
            error!(job = %job_id, error = %e, "failed to open a connection to look up the job");
            return;
        }
    };

    let job = match repo::get_job(&mut conn, job_id).await {
        Ok(job) => job,
        Err(e) => {
            error!(job = %job_id, error = %e, "failed to re-read job for dispatch");
            return;
        }
    };

    for worker in workers {
        let mut inbox = worker.inbox.lock().await;
        if inbox.is_some() || !fleet::can_build(&worker.machine, &job) {
            continue;
        }
        *inbox = Some(job_id);
        drop(inbox);
        worker.notify.notify_one();
        info!(job = %job_id, machine = %worker.machine.store_uri, "dispatched");
        return;
    }

    match repo::no_machine_available(&mut conn, job_id).await {
        Ok(()) => info!(job = %job_id, "no machine available"),
        Err(e) => error!(job = %job_id, error = %e, "failed to record no-machine-available"),
    }
}

/// The pair a failing worker hands to the fatal watcher (§4.5 step 4).
pub struct WorkerFatal {
    pub store_uri: String,
    pub error: anyhow::Error,
}

/// Blocks on the wakeup channel; the first pair received terminates the
/// whole process after logging (§4.5 step 4, §7: worker failures are always
/// fatal to the queue process).
pub async fn run_fatal_watcher(mut rx: mpsc::UnboundedReceiver<WorkerFatal>) {
    match rx.recv().await {
        Some(fatal) => {
            error!(machine = %fatal.store_uri, error = %fatal.error, "worker failed, terminating queue process");
        }
        None => {
            error!("fatal-watcher channel closed with no senders left, terminating queue process");
        }
    }
    std::process::exit(1);
}
