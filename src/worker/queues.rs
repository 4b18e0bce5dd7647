use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use crate::error::{FabricError, Result};

/// Observable state of one target queue.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub paused: bool,
    pub concurrency: u32,
    /// Queued plus in-flight jobs.
    pub length: usize,
}

#[derive(Debug)]
struct TargetQueue {
    concurrency: u32,
    paused: bool,
    queued: VecDeque<u64>,
    inflight: usize,
}

impl TargetQueue {
    fn length(&self) -> usize {
        self.queued.len() + self.inflight
    }
}

/// Per-target bounded work queues. Callers hold the scheduler lock; this
/// structure only does the accounting. Dispatch is two-phase: `push` enqueues,
/// `pop_dispatchable` hands out jobs whose slots are free and marks them
/// in-flight.
#[derive(Debug, Default)]
pub struct TargetQueues {
    targets: HashMap<String, TargetQueue>,
}

impl TargetQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, concurrency: u32) -> Result<()> {
        if concurrency == 0 {
            return Err(FabricError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.targets.contains_key(name) {
            return Err(FabricError::Invalid(format!(
                "target '{name}' already exists"
            )));
        }
        self.targets.insert(
            name.to_string(),
            TargetQueue {
                concurrency,
                paused: false,
                queued: VecDeque::new(),
                inflight: 0,
            },
        );
        Ok(())
    }

    /// A target may only be removed when nothing is queued or running on it.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let queue = self.get(name)?;
        if queue.length() > 0 {
            return Err(FabricError::Invalid(format!(
                "target '{name}' queue is not empty"
            )));
        }
        self.targets.remove(name);
        Ok(())
    }

    pub fn set_concurrency(&mut self, name: &str, concurrency: u32) -> Result<()> {
        if concurrency == 0 {
            return Err(FabricError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        self.get_mut(name)?.concurrency = concurrency;
        Ok(())
    }

    /// Stop dispatching new jobs. Running jobs are unaffected.
    pub fn set_paused(&mut self, name: &str, paused: bool) -> Result<()> {
        self.get_mut(name)?.paused = paused;
        Ok(())
    }

    pub fn push(&mut self, name: &str, id: u64) -> Result<()> {
        self.get_mut(name)?.queued.push_back(id);
        Ok(())
    }

    /// Hand out every job that can start right now, FIFO per target, marking
    /// each in-flight.
    pub fn pop_dispatchable(&mut self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        for (name, queue) in &mut self.targets {
            while !queue.paused
                && queue.inflight < queue.concurrency as usize
                && !queue.queued.is_empty()
            {
                if let Some(id) = queue.queued.pop_front() {
                    queue.inflight += 1;
                    out.push((name.clone(), id));
                }
            }
        }
        out
    }

    /// Free the slot held by a completed job.
    pub fn finish(&mut self, name: &str) {
        if let Some(queue) = self.targets.get_mut(name) {
            queue.inflight = queue.inflight.saturating_sub(1);
        }
    }

    pub fn serves(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn length(&self, name: &str) -> Option<usize> {
        self.targets.get(name).map(TargetQueue::length)
    }

    /// A target has slack when it is not paused and has a free slot.
    pub fn has_slack(&self, name: &str) -> bool {
        self.targets
            .get(name)
            .map(|q| !q.paused && q.length() < q.concurrency as usize)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> BTreeMap<String, TargetStatus> {
        self.targets
            .iter()
            .map(|(name, queue)| {
                (
                    name.clone(),
                    TargetStatus {
                        paused: queue.paused,
                        concurrency: queue.concurrency,
                        length: queue.length(),
                    },
                )
            })
            .collect()
    }

    fn get(&self, name: &str) -> Result<&TargetQueue> {
        self.targets
            .get(name)
            .ok_or_else(|| FabricError::Invalid(format!("invalid target '{name}'")))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut TargetQueue> {
        self.targets
            .get_mut(name)
            .ok_or_else(|| FabricError::Invalid(format!("invalid target '{name}'")))
    }
}
