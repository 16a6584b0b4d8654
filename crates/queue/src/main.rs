//! The queue binary: fleet scheduler + worker runtime (§4.5, §4.6).
//!
//! Startup loads the static machine fleet, builds one worker per machine,
//! sorts by priority, then runs four long-lived task families concurrently:
//! the listener, the dispatcher, one supervisor per worker, and the fatal
//! watcher — matching §5's concurrency model one-for-one.

mod admin;
mod scheduler;
mod worker;

use std::sync::Arc;

use dispatch_core::{fleet, NixCliStore, QueueConfig, RemoteStore};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = QueueConfig::from_env()?;

    let machines_text = tokio::fs::read_to_string(&cfg.machines_file).await?;
    let mut machines = fleet::parse_machines_file(&machines_text)?;
    fleet::sort_by_priority(&mut machines);

    info!(
        fleet_size = machines.len(),
        machines_file = %cfg.machines_file,
        "loaded fleet"
    );

    let workers = Arc::new(scheduler::build_workers(machines));
    let store: Arc<dyn RemoteStore> =
        Arc::new(NixCliStore::new("nix", cfg.substitute_on_destination));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

    let listener_pg = cfg.pg.params.clone();
    let listener_handle = tokio::spawn(scheduler::run_listener(listener_pg, event_tx));

    let dispatcher_pg = cfg.pg.params.clone();
    let dispatcher_workers = workers.clone();
    let dispatcher_handle = tokio::spawn(scheduler::run_dispatcher(
        dispatcher_pg,
        event_rx,
        dispatcher_workers,
    ));

    for handle in workers.iter().cloned() {
        let worker_pg = cfg.pg.params.clone();
        let worker_store = store.clone();
        let worker_fatal_tx = fatal_tx.clone();
        let verbose_job_logs = cfg.verbose_job_logs;
        tokio::spawn(worker::run_worker(
            handle,
            worker_pg,
            worker_store,
            worker_fatal_tx,
            verbose_job_logs,
        ));
    }
    drop(fatal_tx);

    let admin_addr = cfg.admin_addr.clone();
    let admin_workers = workers.clone();
    let admin_handle = tokio::spawn(async move {
        if let Some(addr) = admin_addr {
            let app = admin::router(admin::AdminState {
                workers: admin_workers,
            });
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
            info!(addr = %addr, "admin surface listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        result = listener_handle => {
            result??;
            anyhow::bail!("listener task ended unexpectedly");
        }
        result = dispatcher_handle => {
            result??;
            anyhow::bail!("dispatcher task ended unexpectedly");
        }
        _ = scheduler::run_fatal_watcher(fatal_rx) => {
            unreachable!("run_fatal_watcher never returns");
        }
        result = admin_handle => {
            result??;
            anyhow::bail!("admin task ended unexpectedly");
        }
    }
}
