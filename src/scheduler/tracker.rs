use std::collections::HashMap;

use uuid::Uuid;

use crate::scheduler::job::ExecutionRecord;

/// Jobs with an execution in flight, at most one record per job name.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    running: HashMap<String, ExecutionRecord>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new execution. Returns false, leaving the tracker unchanged,
    /// if the job already has one in flight.
    pub fn insert(&mut self, record: ExecutionRecord) -> bool {
        if self.running.contains_key(&record.job.name) {
            return false;
        }
        self.running.insert(record.job.name.clone(), record);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ExecutionRecord> {
        self.running.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    /// Stop tracking the execution `id` of job `name`. A stale id leaves the
    /// current record in place and returns `None`.
    pub fn remove(&mut self, name: &str, id: Uuid) -> Option<ExecutionRecord> {
        match self.running.get(name) {
            Some(record) if record.id == id => self.running.remove(name),
            _ => None,
        }
    }

    /// Cancel the live execution of `name`. Returns false if there is none.
    pub fn cancel(&self, name: &str) -> bool {
        match self.running.get(name) {
            Some(record) => {
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
