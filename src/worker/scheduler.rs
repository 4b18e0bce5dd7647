//! Concurrency-bounded scheduler: the polling loop, the transactional claim
//! protocol, and manual (synchronous) run handling.
//!
//! The polling loop is retriggered from two sides, external pokes and queue
//! completions. A `polling` flag keeps exactly one cycle in flight; requests
//! arriving meanwhile accumulate in the `nextpoll` backlog and are drained by
//! the running cycle or by the next completion. The flag, the backlog and the
//! queue set share one lock so the two sides never interleave mid-transition.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use super::queues::TargetQueues;
use super::runner::JobRunner;
use crate::config::validate_target_name;
use crate::error::{FabricError, Result};
use crate::storage::{JobOutcome, JobStore};

/// Poll backlog: a set of target names plus an "every served target" sentinel.
#[derive(Debug, Default)]
pub struct PollSet {
    all: bool,
    names: HashSet<String>,
}

impl PollSet {
    pub fn union(&mut self, targets: impl IntoIterator<Item = String>) {
        self.names.extend(targets);
    }

    pub fn set_all(&mut self) {
        self.all = true;
    }

    pub fn clear(&mut self) {
        self.all = false;
        self.names.clear();
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }

    /// Expand to concrete names. Targets removed since they were requested
    /// are dropped.
    pub fn resolve(&self, served: &[String]) -> Vec<String> {
        if self.all {
            served.to_vec()
        } else {
            self.names
                .iter()
                .filter(|name| served.iter().any(|s| s == *name))
                .cloned()
                .collect()
        }
    }
}

#[derive(Debug, Default)]
struct SchedState {
    queues: TargetQueues,
    polling: bool,
    nextpoll: PollSet,
}

/// Aggregated outcome of a `run-manual` batch.
#[derive(Debug, Default, Serialize)]
pub struct ManualReport {
    pub jobs: BTreeMap<u64, JobOutcome>,
    pub errors: BTreeMap<u64, String>,
}

pub struct WorkerScheduler {
    state: Mutex<SchedState>,
    /// One-shot waiters keyed by job id, fulfilled on completion (manual runs).
    waiters: Mutex<HashMap<u64, oneshot::Sender<JobOutcome>>>,
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    fetch_limit: u32,
}

impl WorkerScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: JobRunner,
        targets: &HashMap<String, u32>,
        fetch_limit: u32,
    ) -> Result<Arc<Self>> {
        let mut queues = TargetQueues::new();
        for (name, concurrency) in targets {
            validate_target_name(name)?;
            queues.add(name, *concurrency)?;
        }
        Ok(Arc::new(Self {
            state: Mutex::new(SchedState {
                queues,
                polling: false,
                nextpoll: PollSet::default(),
            }),
            waiters: Mutex::new(HashMap::new()),
            store,
            runner: Arc::new(runner),
            fetch_limit,
        }))
    }

    pub async fn served_targets(&self) -> Vec<String> {
        self.state.lock().await.queues.names()
    }

    /// Record a poll request and run the polling loop. `None` means every
    /// served target.
    pub async fn poll_targets(self: Arc<Self>, targets: Option<Vec<String>>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match targets {
                Some(targets) => {
                    if targets.is_empty() {
                        return Err(FabricError::Invalid("empty targets list".to_string()));
                    }
                    for target in &targets {
                        if !state.queues.serves(target) {
                            return Err(FabricError::Invalid(format!(
                                "invalid target '{target}'"
                            )));
                        }
                    }
                    state.nextpoll.union(targets);
                }
                None => state.nextpoll.set_all(),
            }
        }
        self.poll().await
    }

    /// One polling cycle. Returns without doing anything when there is no
    /// backlog, a cycle is already in flight, or no requested target has a
    /// free slot; in the latter cases a queue completion retriggers the loop.
    pub async fn poll(self: Arc<Self>) -> Result<()> {
        loop {
            let (targets, served) = {
                let mut state = self.state.lock().await;
                let served = state.queues.names();
                let targets = state.nextpoll.resolve(&served);
                if targets.is_empty() {
                    return Ok(());
                }
                if state.polling {
                    return Ok(());
                }
                if !targets.iter().any(|t| state.queues.has_slack(t)) {
                    return Ok(());
                }
                state.polling = true;
                state.nextpoll.clear();
                (targets, served)
            };

            let claimed = self
                .store
                .claim_waiting(&targets, &served, self.fetch_limit)
                .await;

            let mut state = self.state.lock().await;
            state.polling = false;
            let report = match claimed {
                Ok(report) => report,
                // The backlog is not requeued; the next poke retries.
                Err(e) => return Err(e),
            };

            for (id, reason) in &report.ignored {
                tracing::info!(job_id = id, reason, "job ignored at claim");
            }
            for job in &report.accepted {
                if let Err(e) = state.queues.push(&job.target, job.id) {
                    tracing::error!(job_id = job.id, target = %job.target, error = %e,
                        "claimed job has no queue");
                }
            }
            let dispatch = state.queues.pop_dispatchable();

            // A full fetch means more rows may be waiting for these targets.
            if self.fetch_limit > 0 && report.fetched >= self.fetch_limit as usize {
                state.nextpoll.union(targets);
            }
            let more = !state.nextpoll.is_empty();
            drop(state);

            Self::spawn_jobs(&self, dispatch);
            if !more {
                return Ok(());
            }
        }
    }

    fn spawn_jobs(scheduler: &Arc<Self>, jobs: Vec<(String, u64)>) {
        for (target, id) in jobs {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let runner = scheduler.runner.clone();
                let outcome = runner.run(id).await;
                scheduler.job_finished(&target, id, outcome).await;
            });
        }
    }

    /// Queue completion: free the slot, dispatch follow-up work, wake any
    /// manual waiter, retrigger the polling loop.
    async fn job_finished(self: Arc<Self>, target: &str, id: u64, outcome: JobOutcome) {
        let dispatch = {
            let mut state = self.state.lock().await;
            state.queues.finish(target);
            state.queues.pop_dispatchable()
        };
        Self::spawn_jobs(&self, dispatch);

        if let Some(waiter) = self.waiters.lock().await.remove(&id) {
            let _ = waiter.send(outcome);
        }

        if let Err(e) = self.poll().await {
            tracing::warn!(error = %e, "poll after job completion failed");
        }
    }

    /// Claim the given rows as manual jobs, run them, and wait for every
    /// accepted one to finish.
    pub async fn run_manual(self: Arc<Self>, ids: Vec<u64>) -> Result<ManualReport> {
        let mut report = ManualReport::default();

        let mut eligible: Vec<u64> = Vec::new();
        {
            let waiters = self.waiters.lock().await;
            for id in ids {
                if waiters.contains_key(&id) || eligible.contains(&id) {
                    report
                        .errors
                        .insert(id, format!("job {id} is already being executed"));
                } else {
                    eligible.push(id);
                }
            }
        }

        let served = self.served_targets().await;
        let claimed = self.store.claim_manual(&eligible, &served).await?;
        for (id, reason) in claimed.ignored {
            report.errors.insert(id, reason);
        }
        for id in claimed.missing {
            report.errors.insert(id, format!("job {id} not found"));
        }

        let mut pending = Vec::new();
        {
            let mut waiters = self.waiters.lock().await;
            for job in &claimed.accepted {
                let (tx, rx) = oneshot::channel();
                waiters.insert(job.id, tx);
                pending.push((job.id, rx));
            }
        }

        let (dispatch, failed_pushes) = {
            let mut state = self.state.lock().await;
            let mut failed = Vec::new();
            for job in &claimed.accepted {
                if let Err(e) = state.queues.push(&job.target, job.id) {
                    failed.push((job.id, e.to_string()));
                }
            }
            (state.queues.pop_dispatchable(), failed)
        };
        if !failed_pushes.is_empty() {
            let mut waiters = self.waiters.lock().await;
            for (id, error) in failed_pushes {
                waiters.remove(&id);
                pending.retain(|(p, _)| *p != id);
                report.errors.insert(id, error);
            }
        }
        Self::spawn_jobs(&self, dispatch);

        for (id, rx) in pending {
            match rx.await {
                Ok(outcome) => {
                    report.jobs.insert(id, outcome);
                }
                Err(_) => {
                    report.errors.insert(id, format!("job {id} was abandoned"));
                }
            }
        }
        Ok(report)
    }

    pub async fn pause(&self, targets: Option<Vec<String>>) -> Result<()> {
        self.set_paused(targets, true).await
    }

    pub async fn resume(self: Arc<Self>, targets: Option<Vec<String>>) -> Result<()> {
        self.set_paused(targets, false).await?;
        let dispatch = {
            let mut state = self.state.lock().await;
            state.queues.pop_dispatchable()
        };
        Self::spawn_jobs(&self, dispatch);
        Ok(())
    }

    async fn set_paused(&self, targets: Option<Vec<String>>, paused: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let names = match targets {
            Some(targets) if targets.is_empty() => {
                return Err(FabricError::Invalid("empty targets list".to_string()))
            }
            Some(targets) => targets,
            None => state.queues.names(),
        };
        for name in &names {
            if !state.queues.serves(name) {
                return Err(FabricError::Invalid(format!("invalid target '{name}'")));
            }
        }
        for name in &names {
            state.queues.set_paused(name, paused)?;
        }
        Ok(())
    }

    pub async fn add_target(&self, name: &str, concurrency: u32) -> Result<()> {
        validate_target_name(name)?;
        self.state.lock().await.queues.add(name, concurrency)
    }

    pub async fn remove_target(&self, name: &str) -> Result<()> {
        self.state.lock().await.queues.remove(name)
    }

    pub async fn set_target_concurrency(
        self: Arc<Self>,
        name: &str,
        concurrency: u32,
    ) -> Result<()> {
        let dispatch = {
            let mut state = self.state.lock().await;
            state.queues.set_concurrency(name, concurrency)?;
            state.queues.pop_dispatchable()
        };
        Self::spawn_jobs(&self, dispatch);
        Ok(())
    }

    pub async fn status(&self) -> Value {
        let targets = {
            let state = self.state.lock().await;
            state.queues.snapshot()
        };
        let waiting = self.waiters.lock().await.len();
        json!({
            "targets": targets,
            "jobPromisesCount": waiting,
            "memoryUsage": crate::stats::resident_memory_bytes(),
        })
    }
}
