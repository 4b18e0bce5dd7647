//! MySQL-backed job store.
//!
//! All values reach the server through bind parameters; `IN (...)` lists are
//! built as placeholder runs. Claims run inside one transaction with
//! `SELECT ... FOR UPDATE` so two workers can never accept the same row.

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row, Transaction};

use super::{
    classify_rows, ClaimReport, FetchedRow, JobOutcome, JobStatus, JobStore,
};
use crate::config::MysqlConfig;
use crate::error::{FabricError, Result};

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
    table: String,
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

fn is_connection_error(error: &FabricError) -> bool {
    matches!(
        error,
        FabricError::Storage(sqlx::Error::Io(_))
            | FabricError::Storage(sqlx::Error::PoolTimedOut)
            | FabricError::Storage(sqlx::Error::PoolClosed)
    )
}

fn fetched(row: &MySqlRow) -> FetchedRow {
    FetchedRow {
        id: row.get("id"),
        status: row.get("status"),
        target: row.get("target"),
    }
}

impl MySqlStore {
    pub async fn connect(config: &MysqlConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&config.url)
            .await?;
        Ok(Self {
            pool,
            table: config.table.clone(),
        })
    }

    /// Create the job table if it does not exist. The composite index backs
    /// the polling SELECT.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
                target VARCHAR(64) NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'waiting',
                result VARCHAR(8) NULL,
                return_code INT NULL,
                sig VARCHAR(16) NULL,
                stdout MEDIUMTEXT NULL,
                stderr MEDIUMTEXT NULL,
                time_created BIGINT NOT NULL,
                time_started BIGINT NULL,
                time_finished BIGINT NULL,
                INDEX idx_status_target_id (status, target, id)
            )
            "#,
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn claim_waiting_once(
        &self,
        targets: &[String],
        served: &[String],
        fetch_limit: u32,
    ) -> Result<ClaimReport> {
        let mut tx = self.pool.begin().await?;

        let mut sql = format!(
            "SELECT id, status, target FROM {} WHERE status = ? AND target IN ({}) ORDER BY id",
            self.table,
            placeholders(targets.len())
        );
        if fetch_limit > 0 {
            sql.push_str(" LIMIT ?");
        }
        sql.push_str(" FOR UPDATE");

        let mut query = sqlx::query(&sql).bind(JobStatus::Waiting.as_str());
        for target in targets {
            query = query.bind(target);
        }
        if fetch_limit > 0 {
            query = query.bind(fetch_limit);
        }
        let rows = query.fetch_all(&mut *tx).await?;
        let rows: Vec<FetchedRow> = rows.iter().map(fetched).collect();

        let (accepted, ignored) = classify_rows(&rows, JobStatus::Waiting, served);
        let accepted_ids: Vec<u64> = accepted.iter().map(|j| j.id).collect();
        let ignored_ids: Vec<u64> = ignored.iter().map(|(id, _)| *id).collect();
        self.update_status(&mut tx, &accepted_ids, JobStatus::Accepted)
            .await?;
        self.update_status(&mut tx, &ignored_ids, JobStatus::Ignored)
            .await?;
        tx.commit().await?;

        Ok(ClaimReport {
            accepted,
            ignored,
            missing: Vec::new(),
            fetched: rows.len(),
        })
    }

    async fn claim_manual_once(&self, ids: &[u64], served: &[String]) -> Result<ClaimReport> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT id, status, target FROM {} WHERE id IN ({}) ORDER BY id FOR UPDATE",
            self.table,
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&mut *tx).await?;
        let rows: Vec<FetchedRow> = rows.iter().map(fetched).collect();

        let (accepted, ignored) = classify_rows(&rows, JobStatus::Manual, served);
        let missing: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| !rows.iter().any(|r| r.id == *id))
            .collect();
        let accepted_ids: Vec<u64> = accepted.iter().map(|j| j.id).collect();
        let ignored_ids: Vec<u64> = ignored.iter().map(|(id, _)| *id).collect();
        self.update_status(&mut tx, &accepted_ids, JobStatus::Accepted)
            .await?;
        self.update_status(&mut tx, &ignored_ids, JobStatus::Ignored)
            .await?;
        tx.commit().await?;

        Ok(ClaimReport {
            accepted,
            ignored,
            missing,
            fetched: rows.len(),
        })
    }

    async fn update_status(
        &self,
        tx: &mut Transaction<'_, MySql>,
        ids: &[u64],
        status: JobStatus,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET status = ? WHERE id IN ({})",
            self.table,
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(status.as_str());
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }

    async fn mark_running_once(&self, id: u64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, time_started = ? WHERE id = ?",
            self.table
        );
        sqlx::query(&sql)
            .bind(JobStatus::Running.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_done_once(&self, id: u64, outcome: &JobOutcome) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, result = ?, return_code = ?, sig = ?, \
             stdout = ?, stderr = ?, time_finished = ? WHERE id = ?",
            self.table
        );
        sqlx::query(&sql)
            .bind(JobStatus::Done.as_str())
            .bind(outcome.result.as_str())
            .bind(outcome.code)
            .bind(outcome.signal.as_deref())
            .bind(&outcome.stdout)
            .bind(&outcome.stderr)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Run `op` once, and once more if the first attempt failed with a
    /// connection-class error.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match op().await {
            Err(e) if is_connection_error(&e) => {
                tracing::warn!(error = %e, "storage connection error, retrying once");
                op().await
            }
            other => other,
        }
    }
}

#[async_trait]
impl JobStore for MySqlStore {
    async fn claim_waiting(
        &self,
        targets: &[String],
        served: &[String],
        fetch_limit: u32,
    ) -> Result<ClaimReport> {
        if targets.is_empty() {
            return Ok(ClaimReport::default());
        }
        self.with_retry(|| self.claim_waiting_once(targets, served, fetch_limit))
            .await
    }

    async fn claim_manual(&self, ids: &[u64], served: &[String]) -> Result<ClaimReport> {
        if ids.is_empty() {
            return Ok(ClaimReport::default());
        }
        self.with_retry(|| self.claim_manual_once(ids, served)).await
    }

    async fn mark_running(&self, id: u64) -> Result<()> {
        self.with_retry(|| self.mark_running_once(id)).await
    }

    async fn mark_done(&self, id: u64, outcome: &JobOutcome) -> Result<()> {
        self.with_retry(|| self.mark_done_once(id, outcome)).await
    }
}
