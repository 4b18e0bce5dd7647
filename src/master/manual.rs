//! Splits a `run-manual` batch across workers by target and aggregates the
//! per-job results.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::MasterCore;
use crate::error::Result;
use crate::proto::{Connection, Response};

#[derive(Debug, Deserialize)]
pub struct ManualJobSpec {
    pub id: u64,
    pub target: String,
}

/// For each job pick one worker serving its target uniformly at random, send
/// one `run-manual` batch per chosen worker, and merge the outcomes. Jobs
/// nobody serves, and jobs whose worker call failed, land under `errors`.
pub async fn run_manual(core: &Arc<MasterCore>, jobs: Vec<ManualJobSpec>) -> Result<Value> {
    let mut errors = Map::new();
    let mut batches: HashMap<Uuid, (String, Connection, Vec<u64>)> = HashMap::new();
    {
        let registry = core.registry.lock().await;
        let mut rng = rand::thread_rng();
        for job in &jobs {
            let servers = registry.workers_serving(&job.target);
            match servers.choose(&mut rng) {
                Some(pick) => {
                    batches
                        .entry(pick.id)
                        .or_insert_with(|| (pick.display_name(), pick.conn.clone(), Vec::new()))
                        .2
                        .push(job.id);
                }
                None => {
                    errors.insert(
                        job.id.to_string(),
                        json!(format!(
                            "worker serving target '{}' not found",
                            job.target
                        )),
                    );
                }
            }
        }
    }

    let calls = batches.into_values().map(|(worker, conn, ids)| async move {
        let outcome = conn
            .send_request("run-manual", Some(json!({ "ids": ids })))
            .await
            .and_then(Response::into_data);
        (worker, ids, outcome)
    });

    let mut merged_jobs = Map::new();
    for (worker, ids, outcome) in join_all(calls).await {
        match outcome {
            Ok(Some(Value::Object(mut body))) => {
                if let Some(Value::Object(jobs_map)) = body.remove("jobs") {
                    merged_jobs.extend(jobs_map);
                }
                if let Some(Value::Object(errors_map)) = body.remove("errors") {
                    errors.extend(errors_map);
                }
            }
            Ok(_) => {
                for id in ids {
                    errors.insert(
                        id.to_string(),
                        json!(format!("malformed response from worker '{worker}'")),
                    );
                }
            }
            Err(e) => {
                tracing::warn!(worker, error = %e, "run-manual batch failed");
                for id in ids {
                    errors.insert(id.to_string(), json!(e.to_string()));
                }
            }
        }
    }

    Ok(json!({ "jobs": merged_jobs, "errors": errors }))
}
