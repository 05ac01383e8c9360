use crate::{
    error::{Error, Result},
    types::{Timestamp, UniqueId},
};
use core::{fmt, time::Duration};
use serde::Serialize;
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};

/// The closed set of task classes. Each has its own queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ddl,
    Manipulation,
    Query,
}

impl TaskKind {
    pub const ALL: [Self; 3] = [Self::Ddl, Self::Manipulation, Self::Query];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ddl => "ddl",
            Self::Manipulation => "manipulation",
            Self::Query => "query",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Ddl => 0,
            Self::Manipulation => 1,
            Self::Query => 2,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ```text
/// Created -> PreExecuted -> Executing -> Executed
///    \            \             \
///     +------------+-------------+----> Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    PreExecuted,
    Executing,
    Executed,
    Failed,
}

impl TaskState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Failed)
    }
}

/// Ordering metadata the scheduler assigns on submission.
#[derive(Clone, Copy, Debug)]
pub struct TaskMeta {
    pub id: UniqueId,
    pub timestamp: Timestamp,
    pub submitted_at: Instant,
}

/// What a task reports back to its caller.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutput {
    SchemaChanged {
        collection: String,
        collection_id: UniqueId,
        timestamp: Timestamp,
    },
    Inserted {
        first_row_id: UniqueId,
        row_count: u64,
        segment_id: UniqueId,
        message_id: u64,
        timestamp: Timestamp,
    },
    Deleted {
        row_count: u64,
        segment_id: UniqueId,
        message_id: u64,
        timestamp: Timestamp,
    },
    SearchDispatched {
        message_id: u64,
        timestamp: Timestamp,
    },
    Done,
}

/// One client operation, driven through three phases by the scheduler.
///
/// `pre_execute` runs on the submitting caller so that validation errors
/// come back synchronously. `execute` runs on a queue worker while the
/// collection's exclusion token is held, and may be retried when it fails
/// transiently. `post_execute` runs once with the final outcome, before the
/// token is released.
#[tonic::async_trait]
pub trait Task: Send + Sync + 'static {
    fn kind(&self) -> TaskKind;

    /// The collection this task touches.
    fn target(&self) -> &str;

    fn name(&self) -> &'static str;

    async fn pre_execute(&mut self, meta: &TaskMeta) -> Result<()>;

    async fn execute(&mut self, meta: &TaskMeta) -> Result<TaskOutput>;

    async fn post_execute(&mut self, _meta: &TaskMeta, _outcome: &Result<TaskOutput>) -> Result<()> {
        Ok(())
    }
}

/// The caller's side of a submitted task.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: UniqueId,
    kind: TaskKind,
    timestamp: Timestamp,
    state: watch::Receiver<TaskState>,
    done: oneshot::Receiver<Result<TaskOutput>>,
}

impl TaskHandle {
    pub(crate) fn new(
        meta: &TaskMeta,
        kind: TaskKind,
        state: watch::Receiver<TaskState>,
        done: oneshot::Receiver<Result<TaskOutput>>,
    ) -> Self {
        Self {
            id: meta.id,
            kind,
            timestamp: meta.timestamp,
            state,
            done,
        }
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Waits for the terminal state. A task dropped without a result counts
    /// as shut down.
    pub async fn wait(self) -> Result<TaskOutput> {
        self.done.await.unwrap_or(Err(Error::ServiceShutdown))
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout` with
    /// [`Error::Deadline`]. The task keeps running.
    pub async fn wait_for(self, timeout: Duration) -> Result<TaskOutput> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Like [`wait_for`](Self::wait_for), with an absolute deadline.
    pub async fn wait_until(self, deadline: Instant) -> Result<TaskOutput> {
        let task_id = self.id;
        match tokio::time::timeout_at(deadline, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(task_id, "Caller deadline expired");
                Err(Error::Deadline { task_id })
            }
        }
    }
}
