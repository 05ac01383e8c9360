//! Task scheduling.
//!
//! The [`TaskScheduler`] assigns each submitted [`Task`] an identifier and a
//! timestamp, runs its `pre_execute` phase on the caller, then hands it to
//! the queue of its [`TaskKind`]. A fixed pool of worker loops per queue
//! takes tasks in timestamp order and drives them through `execute` and
//! `post_execute`, holding the target collection's exclusion token in
//! between.

mod exclusion;
mod queue;
mod task;

#[cfg(test)]
mod tests;

pub use task::{Task, TaskHandle, TaskKind, TaskMeta, TaskOutput, TaskState};

use crate::{
    allocator::{IdAllocator, TimestampAllocator},
    config::SchedulerConfig,
    error::{Error, Result},
    types::{Timestamp, UniqueId},
};
use core::{future::Future, time::Duration};
use exclusion::{Access, ExclusionTable};
use parking_lot::Mutex;
use queue::{QueuedTask, TaskQueue};
use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::{
    sync::{Notify, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TaskScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: SchedulerConfig,
    ids: Arc<IdAllocator>,
    timestamps: Arc<TimestampAllocator>,
    queues: [TaskQueue; 3],
    exclusion: Arc<ExclusionTable>,
    /// Manipulation tasks not yet finished, by timestamp. Timestamps for
    /// manipulation tasks are assigned under this lock, which is what lets
    /// the time tick trust its minimum.
    unfinished: tokio::sync::Mutex<BTreeSet<(Timestamp, UniqueId)>>,
    accepting: AtomicBool,
    inflight: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        ids: Arc<IdAllocator>,
        timestamps: Arc<TimestampAllocator>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ids,
                timestamps,
                queues: TaskKind::ALL.map(TaskQueue::new),
                exclusion: Arc::default(),
                unfinished: tokio::sync::Mutex::new(BTreeSet::new()),
                accepting: AtomicBool::new(true),
                inflight: AtomicUsize::new(0),
                idle: Notify::new(),
                cancel: parent.child_token(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker loops. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for queue in &self.inner.queues {
            let kind = queue.kind();
            let max_active = self.inner.max_active(kind).max(1);
            for worker in 0..max_active {
                let inner = Arc::clone(&self.inner);
                let span = tracing::info_span!("worker", queue = kind.as_str(), worker);
                workers.push(tokio::spawn(worker_loop(inner, kind).instrument(span)));
            }
        }
        tracing::info!(workers = workers.len(), "Task scheduler started");
    }

    /// Assigns ordering metadata, runs `pre_execute` and enqueues the task.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    /// - Allocation failures while assigning the id or timestamp.
    /// - Whatever `pre_execute` rejects the request with.
    pub async fn submit(&self, task: Box<dyn Task>) -> Result<TaskHandle> {
        self.inner.submit(task, None, None).await
    }

    /// Like [`submit`](Self::submit), but gives up with [`Error::Deadline`]
    /// if the task is not queued by `deadline`. A task abandoned this way
    /// never executes.
    pub async fn submit_before(&self, task: Box<dyn Task>, deadline: Instant) -> Result<TaskHandle> {
        self.inner.submit(task, None, Some(deadline)).await
    }

    /// Submits with a caller-chosen timestamp instead of a fresh one.
    #[cfg(test)]
    pub(crate) async fn submit_at(
        &self,
        task: Box<dyn Task>,
        timestamp: Timestamp,
    ) -> Result<TaskHandle> {
        self.inner.submit(task, Some(timestamp), None).await
    }

    /// Refuses further submissions.
    pub fn stop_accepting(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("Task scheduler stopped accepting tasks");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Tasks submitted and not yet in a terminal state.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    /// Tasks waiting in `kind`'s queue.
    pub fn queued(&self, kind: TaskKind) -> usize {
        self.inner.queue(kind).len()
    }

    /// Waits until no task is in flight or `grace` elapses. Returns whether
    /// everything finished.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let inflight = self.inflight();
            if inflight == 0 {
                return true;
            }
            tracing::debug!(inflight, "Draining in-flight tasks");
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return self.inflight() == 0,
                () = &mut idle => {}
            }
        }
    }

    /// Newest timestamp that no unfinished manipulation task can publish
    /// below: just under the oldest unfinished one, or a fresh timestamp when
    /// there is none.
    pub async fn safe_timestamp(&self) -> Result<Timestamp> {
        let unfinished = self.inner.unfinished.lock().await;
        match unfinished.first() {
            Some((oldest, _)) => Ok(oldest.prev()),
            None => self.inner.timestamps.get_timestamp().await,
        }
    }

    /// Stops the workers and fails every task still queued with
    /// [`Error::ServiceShutdown`]. Returns how many tasks were abandoned.
    pub async fn close(&self) -> usize {
        self.stop_accepting();
        self.inner.cancel.cancel();

        let workers = core::mem::take(&mut *self.workers.lock());
        for mut handle in workers {
            match tokio::time::timeout(WORKER_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Scheduler worker panicked: {e}"),
                Err(_) => {
                    tracing::warn!("Scheduler worker did not stop in time; aborting");
                    handle.abort();
                }
            }
        }

        let mut abandoned = 0;
        for queue in &self.inner.queues {
            for item in queue.drain() {
                abandoned += 1;
                self.inner.finish(item, Err(Error::ServiceShutdown)).await;
            }
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "Abandoned queued tasks at shutdown");
        }
        tracing::info!("Task scheduler closed");
        abandoned
    }
}

impl Inner {
    fn queue(&self, kind: TaskKind) -> &TaskQueue {
        &self.queues[kind.index()]
    }

    fn max_active(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::Ddl => self.config.ddl.max_active,
            TaskKind::Manipulation => self.config.manipulation.max_active,
            TaskKind::Query => self.config.query.max_active,
        }
    }

    async fn submit(
        &self,
        task: Box<dyn Task>,
        timestamp: Option<Timestamp>,
        deadline: Option<Instant>,
    ) -> Result<TaskHandle> {
        // Counted before the check so a concurrent drain cannot miss it.
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if !self.accepting.load(Ordering::Acquire) {
            self.task_done();
            return Err(Error::ServiceShutdown);
        }
        let admitted = self.admit(task, timestamp, deadline).await;
        if admitted.is_err() {
            self.task_done();
        }
        admitted
    }

    async fn admit(
        &self,
        mut task: Box<dyn Task>,
        timestamp: Option<Timestamp>,
        deadline: Option<Instant>,
    ) -> Result<TaskHandle> {
        let kind = task.kind();
        let target = task.target().to_string();
        let id = within(deadline, 0, self.ids.alloc_one()).await?;
        let meta = within(deadline, id, self.assign(kind, &target, id, timestamp)).await?;
        tracing::debug!(
            task_id = meta.id,
            timestamp = %meta.timestamp,
            kind = kind.as_str(),
            task = task.name(),
            target = %target,
            "Task created"
        );

        if let Err(e) = within(deadline, id, task.pre_execute(&meta)).await {
            tracing::debug!(task_id = meta.id, "Task rejected: {e}");
            self.forget(kind, &meta).await;
            self.queue(kind)
                .cancel_reservation(&target, (meta.timestamp, meta.id));
            return Err(e);
        }

        let (state, state_rx) = watch::channel(TaskState::PreExecuted);
        let (done, done_rx) = oneshot::channel();
        let handle = TaskHandle::new(&meta, kind, state_rx, done_rx);
        let item = QueuedTask {
            task,
            target,
            meta,
            requeues: 0,
            state,
            done,
        };
        if let Err(item) = self.queue(kind).push(item) {
            self.finish(item, Err(Error::ServiceShutdown)).await;
        }
        Ok(handle)
    }

    /// Assigns the task's timestamp and reserves its place on the queue in
    /// one step, so no younger task on the target can be taken first.
    /// Nothing is recorded unless the whole assignment succeeds.
    async fn assign(
        &self,
        kind: TaskKind,
        target: &str,
        id: UniqueId,
        timestamp: Option<Timestamp>,
    ) -> Result<TaskMeta> {
        let queue = self.queue(kind);
        let _ordering = queue.ordering().lock().await;
        let timestamp = if kind == TaskKind::Manipulation {
            let mut unfinished = self.unfinished.lock().await;
            let timestamp = self.timestamp(timestamp).await?;
            unfinished.insert((timestamp, id));
            timestamp
        } else {
            self.timestamp(timestamp).await?
        };
        queue.reserve(target, (timestamp, id));
        Ok(TaskMeta {
            id,
            timestamp,
            submitted_at: Instant::now(),
        })
    }

    async fn timestamp(&self, chosen: Option<Timestamp>) -> Result<Timestamp> {
        match chosen {
            Some(timestamp) => Ok(timestamp),
            None => self.timestamps.get_timestamp().await,
        }
    }

    async fn forget(&self, kind: TaskKind, meta: &TaskMeta) {
        if kind == TaskKind::Manipulation {
            self.unfinished.lock().await.remove(&(meta.timestamp, meta.id));
        }
    }

    fn task_done(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn run(&self, queue: &TaskQueue, mut item: QueuedTask) {
        let kind = queue.kind();
        let target = item.target.clone();
        let access = match kind {
            TaskKind::Ddl => Access::Exclusive,
            TaskKind::Manipulation | TaskKind::Query => Access::Shared,
        };

        let guard = match self
            .exclusion
            .acquire(&target, access, self.config.exclusion_wait, &self.cancel)
            .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                item.requeues += 1;
                if item.requeues > self.config.max_requeues {
                    queue.release(&target);
                    let requeues = item.requeues - 1;
                    self.finish(item, Err(Error::ExclusionTimeout {
                        collection: target,
                        requeues,
                    }))
                    .await;
                } else {
                    tracing::debug!(
                        task_id = item.meta.id,
                        requeues = item.requeues,
                        "Exclusion token busy; re-queued task"
                    );
                    if let Err(item) = queue.requeue(item) {
                        self.finish(item, Err(Error::ServiceShutdown)).await;
                    }
                }
                return;
            }
            Err(e) => {
                queue.release(&target);
                self.finish(item, Err(e)).await;
                return;
            }
        };

        item.state.send_replace(TaskState::Executing);
        tracing::trace!(task_id = item.meta.id, "Executing");
        let holds_target = queue.holds_target_while_running();
        if !holds_target {
            queue.release(&target);
        }
        let outcome = self.execute(&mut item).await;

        let outcome = match item.task.post_execute(&item.meta, &outcome).await {
            Ok(()) => outcome,
            Err(e) => {
                tracing::warn!(task_id = item.meta.id, "PostExecute failed: {e}");
                outcome.and(Err(e))
            }
        };
        drop(guard);
        if holds_target {
            queue.release(&target);
        }
        self.finish(item, outcome).await;
    }

    async fn execute(&self, item: &mut QueuedTask) -> Result<TaskOutput> {
        let attempts = self.config.execute_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match item.task.execute(&item.meta).await {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };
            if attempt >= attempts {
                return Err(Error::ExecutionFailed {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }
            tracing::warn!(task_id = item.meta.id, attempt, "Execute failed, retrying: {err}");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::ServiceShutdown),
                () = tokio::time::sleep(self.config.execute_backoff * attempt) => {}
            }
        }
    }

    async fn finish(&self, item: QueuedTask, outcome: Result<TaskOutput>) {
        let kind = item.task.kind();
        let state = match &outcome {
            Ok(_) => TaskState::Executed,
            Err(e) => {
                tracing::debug!(task_id = item.meta.id, "Task failed: {e}");
                TaskState::Failed
            }
        };
        self.forget(kind, &item.meta).await;
        item.state.send_replace(state);
        tracing::debug!(
            task_id = item.meta.id,
            ?state,
            elapsed = ?item.meta.submitted_at.elapsed(),
            "Task finished"
        );
        // The caller may have stopped waiting.
        let _ = item.done.send(outcome);
        self.task_done();
    }
}

/// Bounds `fut` by the caller's deadline, if there is one.
async fn within<T>(
    deadline: Option<Instant>,
    task_id: UniqueId,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(deadline) = deadline else {
        return fut.await;
    };
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(task_id, "Caller deadline expired before the task was queued");
            Err(Error::Deadline { task_id })
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, kind: TaskKind) {
    let queue = inner.queue(kind);
    loop {
        let item = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            item = queue.take() => item,
        };
        inner.run(queue, item).await;
    }
    tracing::trace!("Worker exited");
}
