use super::task::{Task, TaskKind, TaskMeta, TaskOutput, TaskState};
use crate::{
    error::Result,
    types::{Timestamp, UniqueId},
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::{Notify, oneshot, watch};

pub(crate) type TaskKey = (Timestamp, UniqueId);

/// A submitted task together with the channels that report on it.
pub(crate) struct QueuedTask {
    pub(crate) task: Box<dyn Task>,
    pub(crate) target: String,
    pub(crate) meta: TaskMeta,
    pub(crate) requeues: u32,
    pub(crate) state: watch::Sender<TaskState>,
    pub(crate) done: oneshot::Sender<Result<TaskOutput>>,
}

impl QueuedTask {
    fn key(&self) -> TaskKey {
        (self.meta.timestamp, self.meta.id)
    }
}

#[derive(Default)]
struct Entries {
    pending: BTreeMap<TaskKey, QueuedTask>,
    /// Timestamps handed out to tasks still in `pre_execute`, per target.
    reserved: HashMap<String, BTreeSet<TaskKey>>,
    /// Targets with a taken task that has not yet released them.
    active: HashSet<String>,
    closed: bool,
}

impl Entries {
    fn eligible(&self, item: &QueuedTask) -> bool {
        if self.active.contains(&item.target) {
            return false;
        }
        // An older task on the same target has not been queued yet.
        self.reserved
            .get(&item.target)
            .and_then(BTreeSet::first)
            .is_none_or(|oldest| *oldest > item.key())
    }
}

/// Tasks of one kind, ordered by assigned timestamp.
///
/// Every task is reserved on the queue when it gets its timestamp, before
/// `pre_execute` runs, and a worker takes the oldest pushed task whose
/// target has no older reservation and no task still holding it. Tasks on
/// one target therefore reach `execute` in timestamp order, while different
/// targets proceed in parallel.
///
/// DDL and manipulation tasks hold their target until they finish; query
/// tasks release it as soon as they start executing, so queries on one
/// collection overlap.
pub(crate) struct TaskQueue {
    kind: TaskKind,
    entries: Mutex<Entries>,
    /// Serializes timestamp assignment with reservation.
    ordering: tokio::sync::Mutex<()>,
    ready: Notify,
}

impl TaskQueue {
    pub(crate) fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(Entries::default()),
            ordering: tokio::sync::Mutex::new(()),
            ready: Notify::new(),
        }
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Whether a running task keeps its target until it finishes.
    pub(crate) fn holds_target_while_running(&self) -> bool {
        self.kind != TaskKind::Query
    }

    pub(crate) fn ordering(&self) -> &tokio::sync::Mutex<()> {
        &self.ordering
    }

    pub(crate) fn reserve(&self, target: &str, key: TaskKey) {
        self.entries
            .lock()
            .reserved
            .entry(target.to_string())
            .or_default()
            .insert(key);
    }

    /// Drops a reservation whose task never made it into the queue.
    pub(crate) fn cancel_reservation(&self, target: &str, key: TaskKey) {
        unreserve(&mut self.entries.lock(), target, key);
        self.ready.notify_waiters();
    }

    /// Queues a reserved task. Hands it back if the queue is closed.
    pub(crate) fn push(&self, item: QueuedTask) -> core::result::Result<(), QueuedTask> {
        {
            let mut entries = self.entries.lock();
            unreserve(&mut entries, &item.target, item.key());
            if entries.closed {
                return Err(item);
            }
            entries.pending.insert(item.key(), item);
        }
        self.ready.notify_waiters();
        Ok(())
    }

    /// Puts back a task taken by a worker and frees its target.
    pub(crate) fn requeue(&self, item: QueuedTask) -> core::result::Result<(), QueuedTask> {
        {
            let mut entries = self.entries.lock();
            entries.active.remove(&item.target);
            if entries.closed {
                return Err(item);
            }
            entries.pending.insert(item.key(), item);
        }
        self.ready.notify_waiters();
        Ok(())
    }

    /// Frees the target of a taken task.
    pub(crate) fn release(&self, target: &str) {
        self.entries.lock().active.remove(target);
        self.ready.notify_waiters();
    }

    fn try_take(&self) -> Option<QueuedTask> {
        let mut entries = self.entries.lock();
        let key = entries
            .pending
            .values()
            .find(|item| entries.eligible(item))
            .map(QueuedTask::key)?;
        let item = entries.pending.remove(&key)?;
        entries.active.insert(item.target.clone());
        Some(item)
    }

    /// Waits for the next eligible task.
    pub(crate) async fn take(&self) -> QueuedTask {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            if let Some(item) = self.try_take() {
                return item;
            }
            ready.await;
        }
    }

    /// Closes the queue and removes every pending task. Tasks pushed or
    /// requeued afterwards are handed back to the caller.
    pub(crate) fn drain(&self) -> Vec<QueuedTask> {
        let mut entries = self.entries.lock();
        entries.closed = true;
        core::mem::take(&mut entries.pending).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().pending.len()
    }
}

fn unreserve(entries: &mut Entries, target: &str, key: TaskKey) {
    if let Some(keys) = entries.reserved.get_mut(target) {
        keys.remove(&key);
        if keys.is_empty() {
            entries.reserved.remove(target);
        }
    }
}
