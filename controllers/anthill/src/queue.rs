//! Work items and the rate-limited work queue.
//!
//! The watcher turns notifications into [`WorkItem`]s and adds them to the
//! [`WorkQueue`]; workers pull items, hand them to the coordinator and report
//! back with `done`, `forget` or `add_rate_limited`.

use crate::backoff::{ExponentialBackoff, QUEUE_BASE_DELAY, QUEUE_MAX_DELAY};
use crds::GlusterCluster;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// A change notification for one GlusterCluster.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// First observation of the resource
    Created {
        /// Object as delivered
        new: Arc<GlusterCluster>,
    },
    /// Resource changed
    Updated {
        /// Previously delivered object
        old: Arc<GlusterCluster>,
        /// Object as delivered
        new: Arc<GlusterCluster>,
    },
    /// Resource deleted
    Deleted {
        /// Last known object
        old: Arc<GlusterCluster>,
    },
}

impl WorkItem {
    /// Previous state, absent for creations.
    #[must_use]
    pub fn old(&self) -> Option<&GlusterCluster> {
        match self {
            WorkItem::Created { .. } => None,
            WorkItem::Updated { old, .. } | WorkItem::Deleted { old } => Some(old),
        }
    }

    /// Current state, absent for deletions.
    #[must_use]
    pub fn new(&self) -> Option<&GlusterCluster> {
        match self {
            WorkItem::Created { new } | WorkItem::Updated { new, .. } => Some(new),
            WorkItem::Deleted { .. } => None,
        }
    }

    /// `namespace/name` of the resource.
    #[must_use]
    pub fn key(&self) -> String {
        let object = match self {
            WorkItem::Created { new } | WorkItem::Updated { new, .. } => new,
            WorkItem::Deleted { old } => old,
        };
        format!("{}/{}", object.namespace().unwrap_or_default(), object.name_any())
    }

    fn id(&self) -> ItemId {
        let kind = match self {
            WorkItem::Created { .. } => "created",
            WorkItem::Updated { .. } => "updated",
            WorkItem::Deleted { .. } => "deleted",
        };
        ItemId {
            kind,
            key: self.key(),
            old_version: self.old().and_then(|o| o.resource_version()),
            new_version: self.new().and_then(|o| o.resource_version()),
        }
    }
}

/// Identity used for de-duplication: two notifications for the same key and
/// resource versions are the same work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ItemId {
    kind: &'static str,
    key: String,
    old_version: Option<String>,
    new_version: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ItemId>,
    items: HashMap<ItemId, WorkItem>,
    /// Waiting to be processed
    dirty: HashSet<ItemId>,
    /// Handed to a worker, not yet done
    processing: HashSet<ItemId>,
    failures: HashMap<ItemId, u32>,
    shutting_down: bool,
}

/// FIFO work queue with de-duplication and per-item exponential backoff.
///
/// An item already waiting is not queued twice. An item added while a worker
/// holds it is parked and re-queued when the worker calls [`WorkQueue::done`],
/// so one item is never processed by two workers at once.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an item unless an identical one is already waiting.
    pub fn add(&self, item: WorkItem) {
        let id = item.id();
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&id) {
            return;
        }
        state.dirty.insert(id.clone());
        state.items.insert(id.clone(), item);
        if state.processing.contains(&id) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(id);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down;
    /// items still queued at that point are abandoned.
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(id) = state.queue.pop_front() {
                    state.dirty.remove(&id);
                    state.processing.insert(id.clone());
                    if let Some(item) = state.items.get(&id).cloned() {
                        return Some(item);
                    }
                    state.processing.remove(&id);
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Mark an item as processed.
    pub fn done(&self, item: &WorkItem) {
        let id = item.id();
        let mut state = self.lock();
        state.processing.remove(&id);
        if state.dirty.contains(&id) {
            state.queue.push_back(id);
            drop(state);
            self.notify.notify_one();
        } else if !state.failures.contains_key(&id) {
            state.items.remove(&id);
        }
    }

    /// Re-add an item after its backoff delay and count the failure.
    pub fn add_rate_limited(self: &Arc<Self>, item: WorkItem) {
        let id = item.id();
        let delay = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(id).or_insert(0);
            let delay = ExponentialBackoff::calculate_for_failure_count(*failures, QUEUE_BASE_DELAY, QUEUE_MAX_DELAY);
            *failures += 1;
            delay
        };

        debug!("Re-queueing {} in {:?}", item.key(), delay);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clear the failure count of an item.
    pub fn forget(&self, item: &WorkItem) {
        let id = item.id();
        let mut state = self.lock();
        state.failures.remove(&id);
        if !state.dirty.contains(&id) && !state.processing.contains(&id) {
            state.items.remove(&id);
        }
    }

    /// Number of times an item has been re-queued after a failure.
    #[must_use]
    pub fn num_requeues(&self, item: &WorkItem) -> u32 {
        self.lock().failures.get(&item.id()).copied().unwrap_or(0)
    }

    /// Number of items waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no item is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items and wake every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}
