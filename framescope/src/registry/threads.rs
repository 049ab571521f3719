//! Thread registry
//!
//! One [`ThreadEntry`] per distinct [`PipelineThread`] that has interacted with
//! a client. Entries are keyed by the thread object's serial, hold only a
//! `Weak` reference to it, and are never removed: once the thread exits the
//! entry is orphaned and [`ThreadEntry::thread`] returns `None`.

use framescope_common::ThreadDefinition;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::table::GrowableTable;
use crate::domain::{RegistryError, ThreadIndex, Timestamp};
use crate::pipeline::PipelineThread;
use crate::recorder::Recorder;

/// Metadata and recording state for one observed thread.
#[derive(Debug)]
pub struct ThreadEntry {
    index: ThreadIndex,
    name: String,
    sync_name: String,
    registered_stage: u32,
    thread: Weak<PipelineThread>,
    recorder: Mutex<Recorder>,
}

impl ThreadEntry {
    pub fn index(&self) -> ThreadIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sync_name(&self) -> &str {
        &self.sync_name
    }

    /// Pipeline stage the thread was at when it was registered.
    pub fn registered_stage(&self) -> u32 {
        self.registered_stage
    }

    /// The thread object, or `None` once the thread has gone away.
    pub fn thread(&self) -> Option<Arc<PipelineThread>> {
        self.thread.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.thread.strong_count() > 0
    }

    /// Current stage of the live thread, falling back to the registered stage.
    pub fn stage(&self) -> u32 {
        self.thread().map_or(self.registered_stage, |t| t.stage())
    }

    /// Lock this thread's recorder.
    ///
    /// The lock is per thread; in steady state only the owning thread takes it.
    pub fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry-definition frame for this thread.
    pub fn to_wire(&self) -> ThreadDefinition {
        ThreadDefinition {
            index: self.index.0,
            name: self.name.clone(),
            sync_name: self.sync_name.clone(),
            stage: self.registered_stage,
        }
    }
}

/// Concurrent thread-identity → entry registry.
#[derive(Default)]
pub struct ThreadRegistry {
    table: GrowableTable<u64, ThreadEntry>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `thread`, registering it on first sight.
    ///
    /// # Errors
    /// Returns [`RegistryError::Exhausted`] if the index space is used up.
    pub fn resolve(
        &self,
        thread: &Arc<PipelineThread>,
        now: Timestamp,
    ) -> Result<ThreadIndex, RegistryError> {
        if let Some(index) = self.table.find(&thread.serial()) {
            return Ok(ThreadIndex(index));
        }

        let resolved = self
            .table
            .get_or_insert_with(thread.serial(), |index| ThreadEntry {
                index: ThreadIndex(index),
                name: thread.name().to_string(),
                sync_name: thread.sync_name().to_string(),
                registered_stage: thread.stage(),
                thread: Arc::downgrade(thread),
                recorder: Mutex::new(Recorder::new(ThreadIndex(index), now)),
            })
            .ok_or(RegistryError::Exhausted)?;

        if resolved.created {
            log::debug!(
                "registered thread {:?} (sync group {:?}) as {}",
                thread.name(),
                thread.sync_name(),
                ThreadIndex(resolved.index)
            );
        }
        Ok(ThreadIndex(resolved.index))
    }

    /// Number of registered threads.
    pub fn count(&self) -> usize {
        self.table.len()
    }

    /// Entry at `index`.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownThread`] if `index` was never assigned.
    pub fn get(&self, index: ThreadIndex) -> Result<Arc<ThreadEntry>, RegistryError> {
        self.table
            .get(index.as_usize())
            .ok_or(RegistryError::UnknownThread { index, count: self.count() })
    }

    /// All entries with index `>= start`.
    pub fn snapshot_from(&self, start: usize) -> Vec<Arc<ThreadEntry>> {
        self.table.snapshot_from(start)
    }

    /// Live threads whose sync group is `sync_name`.
    pub fn in_sync_group(&self, sync_name: &str) -> Vec<Arc<ThreadEntry>> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|e| e.sync_name == sync_name && e.is_alive())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_same_thread_resolves_once() {
        let registry = ThreadRegistry::new();
        let t = PipelineThread::new("main", "Default");
        let a = registry.resolve(&t, Timestamp(0)).unwrap();
        let b = registry.resolve(&t, Timestamp(5)).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_entry_records_registration_metadata() {
        let registry = ThreadRegistry::new();
        let t = PipelineThread::new("draw", "render");
        t.set_min_stage(1);
        let index = registry.resolve(&t, Timestamp(0)).unwrap();
        t.set_min_stage(3);

        let entry = registry.get(index).unwrap();
        assert_eq!(entry.name(), "draw");
        assert_eq!(entry.sync_name(), "render");
        assert_eq!(entry.registered_stage(), 1);
        assert_eq!(entry.stage(), 3);
        assert_eq!(entry.to_wire().stage, 1);
    }

    #[test]
    fn test_registry_does_not_keep_thread_alive() {
        let registry = ThreadRegistry::new();
        let t = PipelineThread::new("worker", "Default");
        let index = registry.resolve(&t, Timestamp(0)).unwrap();
        drop(t);

        let entry = registry.get(index).unwrap();
        assert!(entry.thread().is_none());
        assert!(!entry.is_alive());
        assert_eq!(entry.stage(), 0);
        assert_eq!(entry.name(), "worker");
    }

    #[test]
    fn test_unknown_index_is_an_error() {
        let registry = ThreadRegistry::new();
        assert!(matches!(
            registry.get(ThreadIndex(0)),
            Err(RegistryError::UnknownThread { count: 0, .. })
        ));
    }

    #[test]
    fn test_sync_group_lists_only_live_members() {
        let registry = ThreadRegistry::new();
        let a = PipelineThread::new("a", "render");
        let b = PipelineThread::new("b", "render");
        let c = PipelineThread::new("c", "Default");
        for t in [&a, &b, &c] {
            registry.resolve(t, Timestamp(0)).unwrap();
        }
        drop(b);

        let names: Vec<String> =
            registry.in_sync_group("render").iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn test_concurrent_registration_assigns_distinct_indices() {
        let registry = Arc::new(ThreadRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let t = PipelineThread::new(format!("t{i}"), "Default");
                    let index = registry.resolve(&t, Timestamp(0)).unwrap();
                    assert_eq!(registry.get(index).unwrap().name(), format!("t{i}"));
                    index
                })
            })
            .collect();
        let mut indices: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 16);
        assert_eq!(registry.count(), 16);
    }
}
