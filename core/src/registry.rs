//! Task id → delegate registry.
//!
//! Uses [`DashMap`] so registration, event lookup and removal for unrelated
//! tasks only contend on their own shard. Lookups clone the delegate out of
//! the map before returning, so no shard lock is held while delegate code
//! runs (a delegate may cancel or start tasks from inside a callback).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::session::{SessionDelegate, TaskId};

/// How the registry refers to a task's delegate.
pub(crate) enum DelegateRef {
    /// Caller-owned delegate; the registry never keeps it alive.
    Weak(Weak<dyn SessionDelegate>),
    /// Delegate created by the session itself (completion closures).
    Owned(Arc<dyn SessionDelegate>),
}

impl DelegateRef {
    fn upgrade(&self) -> Option<Arc<dyn SessionDelegate>> {
        match self {
            DelegateRef::Weak(weak) => weak.upgrade(),
            DelegateRef::Owned(arc) => Some(Arc::clone(arc)),
        }
    }
}

struct TaskEntry {
    delegate: DelegateRef,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: DashMap<TaskId, TaskEntry>,
}

impl TaskRegistry {
    pub fn register(&self, task: TaskId, delegate: DelegateRef, cancelled: Arc<AtomicBool>) {
        self.tasks.insert(task, TaskEntry { delegate, cancelled });
    }

    pub fn remove(&self, task: TaskId) -> bool {
        self.tasks.remove(&task).is_some()
    }

    /// Delegate for a live task. Cancelled tasks yield `None`; stale entries
    /// (delegate dropped) are evicted and their task flagged so the transport
    /// stops.
    pub fn live(&self, task: TaskId) -> Option<Arc<dyn SessionDelegate>> {
        let (delegate, cancelled) = {
            let entry = self.tasks.get(&task)?;
            (entry.delegate.upgrade(), Arc::clone(&entry.cancelled))
        };
        if cancelled.load(Ordering::Acquire) {
            return None;
        }
        match delegate {
            Some(delegate) => Some(delegate),
            None => {
                tracing::warn!(task, "delegate dropped, discarding task events");
                cancelled.store(true, Ordering::Release);
                self.tasks.remove(&task);
                None
            }
        }
    }

    /// Remove a finished task, returning its delegate if the completion
    /// should still be delivered.
    pub fn finish(&self, task: TaskId) -> Option<Arc<dyn SessionDelegate>> {
        let (_, entry) = self.tasks.remove(&task)?;
        if entry.cancelled.load(Ordering::Acquire) {
            return None;
        }
        let delegate = entry.delegate.upgrade();
        if delegate.is_none() {
            tracing::warn!(task, "delegate dropped before completion");
        }
        delegate
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
