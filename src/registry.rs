//! The supervisor's in-memory table of live workers. No persistence: on
//! supervisor restart the registry is empty by definition (`spec.md` §4.4),
//! and the progress=1 recovery path in the reconciler is what re-populates
//! it from observed database/filesystem state.

use std::collections::HashMap;
use std::process::Child;

use crate::channel::Reader;
use crate::model::{JobId, WorkerToken};

/// Everything the supervisor needs to track about one live worker.
pub struct WorkerHandle {
    pub child: Child,
    pub channel: Reader,
    /// The last token seen on this worker's channel across ticks, so a
    /// worker that has gone quiet (no new bytes this tick) is still known
    /// to be in `{started, running, uploading}` rather than falsely
    /// treated as having produced nothing at all.
    pub last_token: Option<WorkerToken>,
}

#[derive(Default)]
pub struct Registry {
    workers: HashMap<JobId, WorkerHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&id)
    }

    pub fn insert(&mut self, id: JobId, handle: WorkerHandle) {
        self.workers.insert(id, handle);
    }

    /// Removes and returns the entry, if any — the caller is responsible
    /// for reaping the child process and closing/removing the channel.
    pub fn remove(&mut self, id: JobId) -> Option<WorkerHandle> {
        self.workers.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use std::process::Command;

    fn dummy_handle(fifo: &std::path::Path) -> WorkerHandle {
        channel::create(fifo).unwrap();
        let reader = Reader::open(fifo).unwrap();
        let child = Command::new("true").spawn().unwrap();
        WorkerHandle {
            child,
            channel: reader,
            last_token: None,
        }
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let fifo = tmp.path().join("signal.fifo");
        let mut reg = Registry::new();
        assert!(!reg.contains(JobId(1)));
        reg.insert(JobId(1), dummy_handle(&fifo));
        assert!(reg.contains(JobId(1)));
        assert_eq!(reg.len(), 1);
        let removed = reg.remove(JobId(1));
        assert!(removed.is_some());
        assert!(!reg.contains(JobId(1)));
        assert!(reg.is_empty());
    }
}
