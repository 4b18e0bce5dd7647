//! Durable job state. The relational table is the source of truth; daemons
//! only update state columns on rows they have claimed under a row lock.

pub mod memory;
pub mod mysql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Manual,
    Accepted,
    Running,
    Done,
    Ignored,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Manual => "manual",
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Ok,
    Fail,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Ok => "ok",
            JobResult::Fail => "fail",
        }
    }
}

/// One row of the job table.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: u64,
    pub target: String,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub return_code: Option<i32>,
    pub sig: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub time_created: i64,
    pub time_started: Option<i64>,
    pub time_finished: Option<i64>,
}

impl JobRow {
    pub fn new(id: u64, target: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id,
            target: target.into(),
            status,
            result: None,
            return_code: None,
            sig: None,
            stdout: None,
            stderr: None,
            time_created: chrono::Utc::now().timestamp(),
            time_started: None,
            time_finished: None,
        }
    }
}

/// Final state of a finished job, written back to storage and returned to
/// `run-manual` waiters.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub result: JobResult,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutcome {
    /// Failure with no child process behind it (spawn error, buffer overrun).
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            result: JobResult::Fail,
            code: None,
            signal: None,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// A row this worker now owns exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: u64,
    pub target: String,
}

/// Outcome of one claim transaction.
#[derive(Debug, Default)]
pub struct ClaimReport {
    pub accepted: Vec<ClaimedJob>,
    /// Rows transitioned to `ignored`, with the reason.
    pub ignored: Vec<(u64, String)>,
    /// Requested ids with no row (manual claims only).
    pub missing: Vec<u64>,
    /// Rows returned by the locking SELECT, before classification.
    pub fetched: usize,
}

/// Raw row as fetched under the row lock, before classification. The status
/// is kept as the raw column value so an unexpected state shows up verbatim
/// in the ignore reason.
#[derive(Debug, Clone)]
pub struct FetchedRow {
    pub id: u64,
    pub status: String,
    pub target: String,
}

/// Split locked rows into accepted and ignored. A row is accepted when its
/// status still matches `needed` and its target is served by this worker.
pub fn classify_rows(
    rows: &[FetchedRow],
    needed: JobStatus,
    served: &[String],
) -> (Vec<ClaimedJob>, Vec<(u64, String)>) {
    let mut accepted = Vec::new();
    let mut ignored = Vec::new();
    for row in rows {
        if row.status != needed.as_str() {
            ignored.push((row.id, format!("status={} != {}", row.status, needed)));
        } else if !served.iter().any(|t| t == &row.target) {
            ignored.push((row.id, format!("unknown target '{}'", row.target)));
        } else {
            accepted.push(ClaimedJob {
                id: row.id,
                target: row.target.clone(),
            });
        }
    }
    (accepted, ignored)
}

/// Transactional access to the job table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim `waiting` rows for `targets` under a row lock. `served` is the
    /// full target set of this worker, used to re-check each row at claim
    /// time. `fetch_limit == 0` disables the row cap.
    async fn claim_waiting(
        &self,
        targets: &[String],
        served: &[String],
        fetch_limit: u32,
    ) -> Result<ClaimReport>;

    /// Claim specific rows expected to be in `manual` status.
    async fn claim_manual(&self, ids: &[u64], served: &[String]) -> Result<ClaimReport>;

    /// Transition a claimed row to `running`, stamping `time_started`.
    async fn mark_running(&self, id: u64) -> Result<()>;

    /// Write the final state of a finished job and stamp `time_finished`.
    async fn mark_done(&self, id: u64, outcome: &JobOutcome) -> Result<()>;
}
