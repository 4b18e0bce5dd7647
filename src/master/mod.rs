//! Master daemon: rendezvous point tracking worker connections and routing
//! client pokes to the workers serving the poked targets.

pub mod handlers;
pub mod manual;
pub mod poker;
pub mod registry;

pub use handlers::MasterDaemon;
pub use poker::{Throttle, ThrottleDecision};
pub use registry::{Registry, WorkerEntry};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::Result;
use crate::proto::{AuthPolicy, Message, Response, Server};
use crate::shutdown::install_shutdown_handler;

pub struct MasterCore {
    pub registry: Mutex<Registry>,
    pending_pokes: Mutex<HashSet<String>>,
    throttle: Mutex<Throttle>,
    ping_interval: Duration,
}

impl MasterCore {
    pub fn new(config: &MasterConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::new()),
            pending_pokes: Mutex::new(HashSet::new()),
            throttle: Mutex::new(Throttle::new(Duration::from_secs(
                config.poke_throttle_interval,
            ))),
            ping_interval: Duration::from_secs(config.ping_interval),
        })
    }

    /// Union the targets into the pending set and drain it, throttled on the
    /// leading edge.
    pub async fn poke(self: Arc<Self>, targets: Vec<String>) {
        self.pending_pokes.lock().await.extend(targets);
        let decision = self.throttle.lock().await.on_call(Instant::now());
        match decision {
            ThrottleDecision::DrainNow => self.drain().await,
            ThrottleDecision::DrainAfter(delay) => {
                let core = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    core.throttle.lock().await.on_timer(Instant::now());
                    core.drain().await;
                });
            }
            ThrottleDecision::Pending => {}
        }
    }

    /// Forward the pending set: one `poll` per worker with the intersection
    /// of its advertisement, best-effort. Targets nobody serves are parked
    /// until a matching worker registers.
    async fn drain(self: Arc<Self>) {
        let targets: Vec<String> = {
            let mut pending = self.pending_pokes.lock().await;
            pending.drain().collect()
        };
        if targets.is_empty() {
            return;
        }
        let mut registry = self.registry.lock().await;
        for entry in registry.entries() {
            let hit: Vec<String> = targets
                .iter()
                .filter(|t| entry.serves(t))
                .cloned()
                .collect();
            if hit.is_empty() {
                continue;
            }
            let conn = entry.conn.clone();
            let worker = entry.display_name();
            tokio::spawn(async move {
                if let Err(e) = conn
                    .send_request("poll", Some(json!({ "targets": hit })))
                    .await
                    .and_then(Response::into_data)
                {
                    tracing::warn!(worker, error = %e, "poke forward failed");
                }
            });
        }
        for target in targets {
            if registry.workers_serving(&target).is_empty() {
                tracing::info!(target, "no worker serves target, deferring poke");
                registry.defer(target);
            }
        }
    }
}

/// Keepalive: ping every registered worker each interval. Dead connections
/// are reaped by their close callbacks, not here.
async fn ping_loop(core: Arc<MasterCore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(core.ping_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let registry = core.registry.lock().await;
        for entry in registry.entries() {
            if let Err(e) = entry.conn.send(Message::Ping) {
                tracing::debug!(worker = entry.display_name(), error = %e, "ping failed");
            }
        }
    }
}

/// Run the master daemon until shutdown.
pub async fn run(config: MasterConfig) -> Result<()> {
    let core = MasterCore::new(&config);
    let daemon = Arc::new(MasterDaemon { core: core.clone() });
    let shutdown = install_shutdown_handler("master");

    tokio::spawn(ping_loop(core, shutdown.clone()));

    let auth = AuthPolicy {
        password: config.password.clone(),
        always_allow_localhost: config.always_allow_localhost,
    };
    let server = Server::bind(&format!("{}:{}", config.host, config.port), auth).await?;
    server.serve(daemon, shutdown).await
}
