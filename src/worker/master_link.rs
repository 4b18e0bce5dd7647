//! Reconnecting registration link from the worker to the master.
//!
//! The master forwards `poll`, `pause`, `continue` and `run-manual` over this
//! same connection, so it is wired to the worker's request handler. Link
//! absence never blocks local serving.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::scheduler::WorkerScheduler;
use crate::proto::{Connection, RequestHandler, Response};

pub struct MasterLink {
    pub addr: String,
    pub password: Option<String>,
    pub reconnect_timeout: Duration,
    pub name: Option<String>,
}

impl MasterLink {
    pub async fn run(
        self,
        scheduler: Arc<WorkerScheduler>,
        handler: Arc<dyn RequestHandler>,
        shutdown: CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match Connection::connect(&self.addr, self.password.clone(), handler.clone()).await {
                Ok(conn) => {
                    let targets = scheduler.served_targets().await;
                    let data = json!({ "targets": targets, "name": self.name });
                    match conn
                        .send_request("register-worker", Some(data))
                        .await
                        .and_then(Response::into_data)
                    {
                        Ok(_) => tracing::info!(addr = %self.addr, "registered with master"),
                        Err(e) => {
                            tracing::warn!(addr = %self.addr, error = %e, "registration failed")
                        }
                    }
                    tokio::select! {
                        _ = conn.wait_closed() => {
                            tracing::warn!(addr = %self.addr, "master connection lost");
                        }
                        _ = shutdown.cancelled() => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(addr = %self.addr, error = %e, "failed to connect to master")
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_timeout) => {}
            }
        }
    }
}
