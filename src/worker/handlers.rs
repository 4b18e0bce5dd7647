//! Request dispatch for the worker daemon.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::scheduler::WorkerScheduler;
use crate::error::{FabricError, Result};
use crate::proto::{Connection, Request, RequestHandler};

pub struct WorkerDaemon {
    pub scheduler: Arc<WorkerScheduler>,
}

#[derive(Debug, Deserialize)]
struct TargetsParams {
    #[serde(default)]
    targets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TargetParams {
    target: String,
}

#[derive(Debug, Deserialize)]
struct TargetConcurrencyParams {
    target: String,
    concurrency: u32,
}

#[derive(Debug, Deserialize)]
struct RunManualParams {
    ids: Vec<u64>,
}

/// Decode the request payload into the handler's param struct. A missing
/// payload decodes like an empty object.
pub(crate) fn params<T: DeserializeOwned>(data: Option<Value>) -> Result<T> {
    let value = data.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| FabricError::Invalid(format!("bad payload: {e}")))
}

pub(crate) fn ok() -> Value {
    Value::String("ok".to_string())
}

#[async_trait]
impl RequestHandler for WorkerDaemon {
    async fn handle(&self, request: Request, _conn: &Connection) -> Result<Value> {
        match request.kind.as_str() {
            "poll" => {
                let p: TargetsParams = params(request.data)?;
                self.scheduler.clone().poll_targets(p.targets).await?;
                Ok(ok())
            }
            "pause" => {
                let p: TargetsParams = params(request.data)?;
                self.scheduler.pause(p.targets).await?;
                Ok(ok())
            }
            "continue" => {
                let p: TargetsParams = params(request.data)?;
                self.scheduler.clone().resume(p.targets).await?;
                Ok(ok())
            }
            "status" => Ok(self.scheduler.status().await),
            "add-target" => {
                let p: TargetConcurrencyParams = params(request.data)?;
                self.scheduler.add_target(&p.target, p.concurrency).await?;
                Ok(ok())
            }
            "remove-target" => {
                let p: TargetParams = params(request.data)?;
                self.scheduler.remove_target(&p.target).await?;
                Ok(ok())
            }
            "set-target-concurrency" => {
                let p: TargetConcurrencyParams = params(request.data)?;
                self.scheduler
                    .clone()
                    .set_target_concurrency(&p.target, p.concurrency)
                    .await?;
                Ok(ok())
            }
            "run-manual" => {
                let p: RunManualParams = params(request.data)?;
                let report = self.scheduler.clone().run_manual(p.ids).await?;
                serde_json::to_value(report)
                    .map_err(|e| FabricError::Protocol(e.to_string()))
            }
            other => Err(FabricError::UnknownRequestType(other.to_string())),
        }
    }
}
