//! In-memory job store, a behavioral twin of the MySQL store for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    classify_rows, ClaimReport, FetchedRow, JobOutcome, JobRow, JobStatus, JobStore,
};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<u64, JobRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, row: JobRow) {
        self.rows.lock().await.insert(row.id, row);
    }

    pub async fn insert_waiting(&self, id: u64, target: &str) {
        self.insert(JobRow::new(id, target, JobStatus::Waiting)).await;
    }

    pub async fn insert_manual(&self, id: u64, target: &str) {
        self.insert(JobRow::new(id, target, JobStatus::Manual)).await;
    }

    pub async fn row(&self, id: u64) -> Option<JobRow> {
        self.rows.lock().await.get(&id).cloned()
    }

    /// Rows currently in `status` for `target`.
    pub async fn count_in_status(&self, target: &str, status: JobStatus) -> usize {
        self.rows
            .lock()
            .await
            .values()
            .filter(|r| r.target == target && r.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn claim_waiting(
        &self,
        targets: &[String],
        served: &[String],
        fetch_limit: u32,
    ) -> Result<ClaimReport> {
        let mut rows = self.rows.lock().await;
        // BTreeMap iteration gives the ORDER BY id of the SQL twin.
        let mut fetched = Vec::new();
        for row in rows.values() {
            if fetch_limit > 0 && fetched.len() >= fetch_limit as usize {
                break;
            }
            if row.status == JobStatus::Waiting && targets.iter().any(|t| t == &row.target) {
                fetched.push(FetchedRow {
                    id: row.id,
                    status: row.status.as_str().to_string(),
                    target: row.target.clone(),
                });
            }
        }

        let (accepted, ignored) = classify_rows(&fetched, JobStatus::Waiting, served);
        for job in &accepted {
            if let Some(row) = rows.get_mut(&job.id) {
                row.status = JobStatus::Accepted;
            }
        }
        for (id, _) in &ignored {
            if let Some(row) = rows.get_mut(id) {
                row.status = JobStatus::Ignored;
            }
        }
        Ok(ClaimReport {
            accepted,
            ignored,
            missing: Vec::new(),
            fetched: fetched.len(),
        })
    }

    async fn claim_manual(&self, ids: &[u64], served: &[String]) -> Result<ClaimReport> {
        let mut rows = self.rows.lock().await;
        let fetched: Vec<FetchedRow> = ids
            .iter()
            .filter_map(|id| rows.get(id))
            .map(|row| FetchedRow {
                id: row.id,
                status: row.status.as_str().to_string(),
                target: row.target.clone(),
            })
            .collect();

        let (accepted, ignored) = classify_rows(&fetched, JobStatus::Manual, served);
        let missing: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| !rows.contains_key(id))
            .collect();
        for job in &accepted {
            if let Some(row) = rows.get_mut(&job.id) {
                row.status = JobStatus::Accepted;
            }
        }
        for (id, _) in &ignored {
            if let Some(row) = rows.get_mut(id) {
                row.status = JobStatus::Ignored;
            }
        }
        Ok(ClaimReport {
            accepted,
            ignored,
            missing,
            fetched: fetched.len(),
        })
    }

    async fn mark_running(&self, id: u64) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&id) {
            row.status = JobStatus::Running;
            row.time_started = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }

    async fn mark_done(&self, id: u64, outcome: &JobOutcome) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&id) {
            row.status = JobStatus::Done;
            row.result = Some(outcome.result);
            row.return_code = outcome.code;
            row.sig = outcome.signal.clone();
            row.stdout = Some(outcome.stdout.clone());
            row.stderr = Some(outcome.stderr.clone());
            row.time_finished = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }
}
