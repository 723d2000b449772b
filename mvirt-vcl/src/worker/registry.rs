//! Process-wide worker registry.
//!
//! Each entry pairs the worker record with the sending side of its event
//! queue, so other threads can reach a worker without locking its record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{Result, VclError};
use crate::event::EventQueueSender;
use crate::pool::Pool;

use super::Worker;

/// Registered worker.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub wrk_index: u32,
    pub worker: Arc<Mutex<Worker>>,
    /// Queue for messages from other workers.
    pub mq: EventQueueSender,
}

impl WorkerEntry {
    /// Lock the worker record, recovering from poisoning.
    pub fn lock(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registrations are rare, so a single mutex guards the pool.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Mutex<Pool<WorkerEntry>>,
    max_workers: u32,
}

impl WorkerRegistry {
    pub fn new(max_workers: u32) -> Self {
        WorkerRegistry {
            workers: Mutex::new(Pool::with_capacity_limit(max_workers)),
            max_workers,
        }
    }

    fn pool(&self) -> MutexGuard<'_, Pool<WorkerEntry>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker built from its future index.
    pub fn register(&self, build: impl FnOnce(u32) -> Result<Worker>) -> Result<WorkerEntry> {
        let mut pool = self.pool();
        let index = pool
            .next_index()
            .ok_or(VclError::TooManyWorkers(self.max_workers))?;
        let worker = build(index)?;
        let entry = WorkerEntry {
            wrk_index: index,
            mq: worker.event_sender(),
            worker: Arc::new(Mutex::new(worker)),
        };
        let inserted = pool
            .insert_with(|_| entry.clone())
            .ok_or(VclError::TooManyWorkers(self.max_workers))?;
        debug_assert_eq!(inserted, index);
        debug!(wrk_index = index, live = pool.len(), "Registered worker");
        Ok(entry)
    }

    /// Swap the record at `wrk_index` for a fresh one, keeping the index.
    pub fn replace(&self, wrk_index: u32, worker: Worker) -> Result<WorkerEntry> {
        let mut pool = self.pool();
        let slot = pool
            .get_mut(wrk_index)
            .ok_or(VclError::UnknownWorker(wrk_index))?;
        *slot = WorkerEntry {
            wrk_index,
            mq: worker.event_sender(),
            worker: Arc::new(Mutex::new(worker)),
        };
        Ok(slot.clone())
    }

    pub fn get(&self, wrk_index: u32) -> Result<WorkerEntry> {
        self.pool()
            .get(wrk_index)
            .cloned()
            .ok_or(VclError::UnknownWorker(wrk_index))
    }

    pub fn unregister(&self, wrk_index: u32) -> Option<WorkerEntry> {
        let entry = self.pool().remove(wrk_index);
        if entry.is_some() {
            debug!(wrk_index, "Unregistered worker");
        }
        entry
    }

    pub fn indices(&self) -> Vec<u32> {
        self.pool().indices()
    }

    pub fn len(&self) -> usize {
        self.pool().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VclConfig;
    use crate::segment::SegmentManager;
    use crate::test_util::ScriptedDataplane;

    fn build(idx: u32) -> Result<Worker> {
        Worker::new(
            idx,
            &VclConfig::default(),
            Arc::new(SegmentManager::new(1)),
            ScriptedDataplane::new(),
            1,
        )
    }

    #[test]
    fn test_register_reuses_freed_index() {
        let registry = WorkerRegistry::new(4);
        assert_eq!(registry.register(build).unwrap().wrk_index, 0);
        assert_eq!(registry.register(build).unwrap().wrk_index, 1);
        registry.unregister(0).unwrap();
        let entry = registry.register(build).unwrap();
        assert_eq!(entry.wrk_index, 0);
        assert_eq!(entry.lock().wrk_index, 0);
    }

    #[test]
    fn test_register_limit() {
        let registry = WorkerRegistry::new(1);
        registry.register(build).unwrap();
        assert!(matches!(
            registry.register(build),
            Err(VclError::TooManyWorkers(1))
        ));
    }

    #[test]
    fn test_failed_build_leaves_no_slot() {
        let registry = WorkerRegistry::new(2);
        let err = registry.register(|_| Err(VclError::NotAttached));
        assert!(matches!(err, Err(VclError::NotAttached)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replace_keeps_index() {
        let registry = WorkerRegistry::new(2);
        let old = registry.register(build).unwrap();
        let fresh = registry.replace(0, build(0).unwrap()).unwrap();
        assert!(!old.mq.same_queue(&fresh.mq));
        assert!(registry.get(0).unwrap().mq.same_queue(&fresh.mq));
        assert!(matches!(registry.get(5), Err(VclError::UnknownWorker(5))));
    }
}
