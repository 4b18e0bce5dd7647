//! Request dispatch for the master daemon.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};

use super::manual::{self, ManualJobSpec};
use super::registry::WorkerEntry;
use super::MasterCore;
use crate::error::{FabricError, Result};
use crate::proto::{Connection, Request, RequestHandler, Response};
use crate::worker::handlers::{ok, params};

pub struct MasterDaemon {
    pub core: Arc<MasterCore>,
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    targets: Vec<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PokeParams {
    targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TargetsParams {
    #[serde(default)]
    targets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    #[serde(default)]
    poll_workers: bool,
}

#[derive(Debug, Deserialize)]
struct RunManualParams {
    jobs: Vec<ManualJobSpec>,
}

impl MasterDaemon {
    async fn register_worker(&self, p: RegisterParams, conn: &Connection) -> Result<Value> {
        if p.targets.is_empty() {
            return Err(FabricError::Invalid("empty targets list".to_string()));
        }
        if p.targets.iter().any(|t| t.is_empty()) {
            return Err(FabricError::Invalid("empty target name".to_string()));
        }

        let entry = WorkerEntry {
            id: conn.id(),
            name: p.name,
            targets: p.targets,
            conn: conn.clone(),
        };
        let worker = entry.display_name();
        let targets = entry.targets.clone();
        let drained = {
            let mut registry = self.core.registry.lock().await;
            registry.register(entry)
        };
        tracing::info!(worker, ?targets, "worker registered");

        let core = self.core.clone();
        let id = conn.id();
        let closed_worker = worker.clone();
        conn.on_close(move || {
            tokio::spawn(async move {
                core.registry.lock().await.remove(id);
                tracing::info!(worker = closed_worker, "worker removed");
            });
        })
        .await;

        // Wake the new worker for any pokes that were waiting for its targets.
        if !drained.is_empty() {
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(e) = conn
                    .send_request("poll", Some(json!({ "targets": drained })))
                    .await
                    .and_then(Response::into_data)
                {
                    tracing::warn!(worker, error = %e, "deferred poke delivery failed");
                }
            });
        }
        Ok(ok())
    }

    /// Forward `pause`/`continue` to workers. With `targets` omitted every
    /// worker is addressed with its full advertisement; otherwise each worker
    /// gets the intersection.
    async fn forward_pause(&self, kind: &str, targets: Option<Vec<String>>) -> Result<Value> {
        if let Some(targets) = &targets {
            if targets.is_empty() {
                return Err(FabricError::Invalid("empty targets list".to_string()));
            }
        }
        let calls: Vec<(String, Connection, Option<Vec<String>>)> = {
            let registry = self.core.registry.lock().await;
            registry
                .entries()
                .iter()
                .filter_map(|entry| match &targets {
                    None => Some((entry.display_name(), entry.conn.clone(), None)),
                    Some(targets) => {
                        let hit: Vec<String> = targets
                            .iter()
                            .filter(|t| entry.serves(t))
                            .cloned()
                            .collect();
                        (!hit.is_empty()).then(|| {
                            (entry.display_name(), entry.conn.clone(), Some(hit))
                        })
                    }
                })
                .collect()
        };

        let kind = kind.to_string();
        let tasks = calls.into_iter().map(|(worker, conn, hit)| {
            let kind = kind.clone();
            async move {
                let data = hit.map(|targets| json!({ "targets": targets }));
                if let Err(e) = conn
                    .send_request(&kind, data)
                    .await
                    .and_then(Response::into_data)
                {
                    tracing::warn!(worker, kind, error = %e, "forward failed");
                }
            }
        });
        join_all(tasks).await;
        Ok(ok())
    }

    async fn status(&self, p: StatusParams) -> Result<Value> {
        let workers: Vec<(String, Vec<String>, Connection)> = {
            let registry = self.core.registry.lock().await;
            registry
                .entries()
                .iter()
                .map(|e| (e.display_name(), e.targets.clone(), e.conn.clone()))
                .collect()
        };

        let entries = if p.poll_workers {
            let tasks = workers.into_iter().map(|(name, targets, conn)| async move {
                let status = match conn
                    .send_request("status", None)
                    .await
                    .and_then(Response::into_data)
                {
                    Ok(data) => data.unwrap_or(Value::Null),
                    Err(e) => Value::String(e.to_string()),
                };
                json!({ "name": name, "targets": targets, "status": status })
            });
            join_all(tasks).await
        } else {
            workers
                .into_iter()
                .map(|(name, targets, _)| json!({ "name": name, "targets": targets }))
                .collect()
        };

        Ok(json!({
            "workers": entries,
            "memoryUsage": crate::stats::resident_memory_bytes(),
        }))
    }
}

#[async_trait]
impl RequestHandler for MasterDaemon {
    async fn handle(&self, request: Request, conn: &Connection) -> Result<Value> {
        match request.kind.as_str() {
            "register-worker" => {
                let p: RegisterParams = params(request.data)?;
                self.register_worker(p, conn).await
            }
            "poke" => {
                let p: PokeParams = params(request.data)?;
                if p.targets.is_empty() {
                    return Err(FabricError::Invalid("empty targets list".to_string()));
                }
                self.core.clone().poke(p.targets).await;
                Ok(ok())
            }
            "pause" => {
                let p: TargetsParams = params(request.data)?;
                self.forward_pause("pause", p.targets).await
            }
            "continue" => {
                let p: TargetsParams = params(request.data)?;
                self.forward_pause("continue", p.targets).await
            }
            "status" => {
                let p: StatusParams = params(request.data)?;
                self.status(p).await
            }
            "run-manual" => {
                let p: RunManualParams = params(request.data)?;
                manual::run_manual(&self.core, p.jobs).await
            }
            other => Err(FabricError::UnknownRequestType(other.to_string())),
        }
    }
}
