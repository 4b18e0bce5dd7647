use std::collections::HashSet;

use uuid::Uuid;

use crate::proto::Connection;

/// One registered worker. Lives as long as its connection.
pub struct WorkerEntry {
    pub id: Uuid,
    pub name: Option<String>,
    pub targets: Vec<String>,
    pub conn: Connection,
}

impl WorkerEntry {
    pub fn serves(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.conn.peer().to_string())
    }
}

/// The set of registered workers plus pokes waiting for a serving worker.
#[derive(Default)]
pub struct Registry {
    entries: Vec<WorkerEntry>,
    deferred: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Returns the deferred pokes its advertisement drains;
    /// the caller forwards those as an immediate poll. Re-registration on the
    /// same connection replaces the previous advertisement.
    pub fn register(&mut self, entry: WorkerEntry) -> Vec<String> {
        self.entries.retain(|e| e.id != entry.id);
        let drained: Vec<String> = self
            .deferred
            .iter()
            .filter(|t| entry.serves(t))
            .cloned()
            .collect();
        for target in &drained {
            self.deferred.remove(target);
        }
        self.entries.push(entry);
        drained
    }

    pub fn remove(&mut self, id: Uuid) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn entries(&self) -> &[WorkerEntry] {
        &self.entries
    }

    pub fn workers_serving(&self, target: &str) -> Vec<&WorkerEntry> {
        self.entries.iter().filter(|e| e.serves(target)).collect()
    }

    /// Park a poke until a worker serving `target` registers.
    pub fn defer(&mut self, target: String) {
        self.deferred.insert(target);
    }

    pub fn deferred(&self) -> &HashSet<String> {
        &self.deferred
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
