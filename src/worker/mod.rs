//! Worker daemon: executes jobs as child processes with per-target bounded
//! concurrency.
//!
//! The worker polls the job table for claimable rows, never inserting or
//! deleting them. Components:
//!
//! - [`TargetQueues`]: per-target bounded work queues
//! - [`WorkerScheduler`]: polling loop and claim protocol
//! - [`JobRunner`]: spawns the launcher child and captures its output
//! - [`MasterLink`]: reconnecting registration link to the master
//!
//! # Job Flow
//!
//! 1. A poke (from the master or a direct client) records targets to poll
//! 2. The scheduler claims `waiting` rows inside a locking transaction
//! 3. Accepted rows are queued per target and dispatched FIFO
//! 4. [`JobRunner::run`] executes the launcher and writes the final row

pub mod handlers;
pub mod master_link;
pub mod queues;
pub mod runner;
pub mod scheduler;

pub use handlers::WorkerDaemon;
pub use master_link::MasterLink;
pub use queues::TargetQueues;
pub use runner::JobRunner;
pub use scheduler::{ManualReport, PollSet, WorkerScheduler};

use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::proto::{AuthPolicy, RequestHandler, Server};
use crate::shutdown::install_shutdown_handler;
use crate::storage::MySqlStore;

/// Run the worker daemon until shutdown. With `init_schema` the job table is
/// created first; by default the table is owned by the job producers.
pub async fn run(config: WorkerConfig, init_schema: bool) -> Result<()> {
    config.validate()?;

    let store = Arc::new(MySqlStore::connect(&config.mysql).await?);
    if init_schema {
        store.ensure_schema().await?;
    }
    let runner = JobRunner::new(
        store.clone(),
        config.launcher.clone(),
        config.max_output_buffer,
    );
    let scheduler = WorkerScheduler::new(store, runner, &config.targets, config.mysql.fetch_limit)?;
    let daemon = Arc::new(WorkerDaemon {
        scheduler: scheduler.clone(),
    });
    let shutdown = install_shutdown_handler("worker");

    if let Some(master_host) = &config.master_host {
        let link = MasterLink {
            addr: format!("{}:{}", master_host, config.master_port),
            password: config.password.clone(),
            reconnect_timeout: Duration::from_secs(config.master_reconnect_timeout),
            name: config.name.clone(),
        };
        let link_handler: Arc<dyn RequestHandler> = daemon.clone();
        let link_scheduler = scheduler.clone();
        let link_shutdown = shutdown.clone();
        tokio::spawn(async move {
            link.run(link_scheduler, link_handler, link_shutdown).await;
        });
    }

    let auth = AuthPolicy {
        password: config.password.clone(),
        always_allow_localhost: config.always_allow_localhost,
    };
    let server = Server::bind(&format!("{}:{}", config.host, config.port), auth).await?;
    server.serve(daemon, shutdown).await
}
