use super::*;
use crate::{
    authority::{Authority, LocalAuthority},
    config::{AllocatorConfig, QueueConfig},
};
use futures::future::join_all;
use std::sync::atomic::AtomicU32;
use std::time::Instant as WallInstant;

#[derive(Clone, Copy, Debug)]
struct Span {
    label: &'static str,
    start: WallInstant,
    end: WallInstant,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

type Log = Arc<Mutex<Vec<Span>>>;

struct Recorder {
    label: &'static str,
    kind: TaskKind,
    target: &'static str,
    work: Duration,
    prepare: Duration,
    reject: bool,
    transient_failures: Arc<AtomicU32>,
    log: Log,
}

impl Recorder {
    fn new(label: &'static str, kind: TaskKind, target: &'static str, log: &Log) -> Self {
        Self {
            label,
            kind,
            target,
            work: Duration::from_millis(50),
            prepare: Duration::ZERO,
            reject: false,
            transient_failures: Arc::default(),
            log: Arc::clone(log),
        }
    }

    fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    fn prepare(mut self, prepare: Duration) -> Self {
        self.prepare = prepare;
        self
    }

    fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}

#[tonic::async_trait]
impl Task for Recorder {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn target(&self) -> &str {
        self.target
    }

    fn name(&self) -> &'static str {
        self.label
    }

    async fn pre_execute(&mut self, _meta: &TaskMeta) -> Result<()> {
        if !self.prepare.is_zero() {
            tokio::time::sleep(self.prepare).await;
        }
        if self.reject {
            return Err(Error::invalid("rejected"));
        }
        Ok(())
    }

    async fn execute(&mut self, _meta: &TaskMeta) -> Result<TaskOutput> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Bus {
                channel: "recorder".into(),
                reason: "injected".into(),
            });
        }
        let start = WallInstant::now();
        tokio::time::sleep(self.work).await;
        self.log.lock().push(Span {
            label: self.label,
            start,
            end: WallInstant::now(),
        });
        Ok(TaskOutput::Done)
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        ddl: QueueConfig { max_active: 1 },
        manipulation: QueueConfig { max_active: 4 },
        query: QueueConfig { max_active: 4 },
        exclusion_wait: Duration::from_secs(2),
        max_requeues: 3,
        execute_attempts: 3,
        execute_backoff: Duration::from_millis(5),
    }
}

fn scheduler(config: SchedulerConfig) -> TaskScheduler {
    let authority: Arc<dyn Authority> = Arc::new(LocalAuthority::default());
    let cancel = CancellationToken::new();
    let ids = Arc::new(IdAllocator::new(
        Arc::clone(&authority),
        AllocatorConfig::default(),
        &cancel,
    ));
    let timestamps = Arc::new(TimestampAllocator::new(
        authority,
        AllocatorConfig::default(),
        &cancel,
    ));
    TaskScheduler::new(config, ids, timestamps, &cancel)
}

fn span(log: &Log, label: &str) -> Span {
    *log.lock()
        .iter()
        .find(|s| s.label == label)
        .unwrap_or_else(|| panic!("{label} never executed"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn smaller_timestamp_executes_first_regardless_of_submission_order() {
    let log = Log::default();
    let sched = scheduler(config());

    let b = sched
        .submit_at(
            Recorder::new("b", TaskKind::Manipulation, "c", &log).boxed(),
            Timestamp::from_raw(20),
        )
        .await
        .unwrap();
    let a = sched
        .submit_at(
            Recorder::new("a", TaskKind::Manipulation, "c", &log).boxed(),
            Timestamp::from_raw(10),
        )
        .await
        .unwrap();
    assert_eq!(a.state(), TaskState::PreExecuted);

    sched.start();
    a.wait().await.unwrap();
    b.wait().await.unwrap();

    assert!(span(&log, "a").end <= span(&log, "b").start);
    sched.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_pre_execute_keeps_its_place_in_line() {
    let log = Log::default();
    let sched = Arc::new(scheduler(config()));
    sched.start();

    let slow = {
        let sched = Arc::clone(&sched);
        let recorder = Recorder::new("slow", TaskKind::Manipulation, "c", &log)
            .prepare(Duration::from_millis(200));
        tokio::spawn(async move { sched.submit(recorder.boxed()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let fast = sched
        .submit(Recorder::new("fast", TaskKind::Manipulation, "c", &log).boxed())
        .await
        .unwrap();
    let slow = slow.await.unwrap().unwrap();
    assert!(slow.timestamp() < fast.timestamp());

    slow.wait().await.unwrap();
    fast.wait().await.unwrap();
    assert!(span(&log, "slow").end <= span(&log, "fast").start);
    sched.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_pre_execute_unblocks_younger_tasks() {
    let log = Log::default();
    let sched = Arc::new(scheduler(config()));
    sched.start();

    let rejected = {
        let sched = Arc::clone(&sched);
        let mut recorder = Recorder::new("rejected", TaskKind::Manipulation, "c", &log)
            .prepare(Duration::from_millis(100));
        recorder.reject = true;
        tokio::spawn(async move { sched.submit(recorder.boxed()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let next = sched
        .submit(Recorder::new("next", TaskKind::Manipulation, "c", &log).boxed())
        .await
        .unwrap();

    assert!(matches!(
        rejected.await.unwrap(),
        Err(Error::ValidationFailed { .. })
    ));
    next.wait_for(Duration::from_secs(2)).await.unwrap();
    sched.close().await;
}

#[tokio::test]
async fn expired_deadline_before_queueing_never_runs_the_task() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let recorder = Recorder::new("late", TaskKind::Manipulation, "c", &log)
        .prepare(Duration::from_millis(300));
    let result = sched
        .submit_before(recorder.boxed(), Instant::now() + Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(Error::Deadline { .. })));
    assert_eq!(sched.inflight(), 0);

    // The abandoned reservation must not hold up the target.
    let next = sched
        .submit(Recorder::new("next", TaskKind::Manipulation, "c", &log).boxed())
        .await
        .unwrap();
    let next_ts = next.timestamp();
    next.wait_for(Duration::from_secs(2)).await.unwrap();
    assert!(sched.safe_timestamp().await.unwrap() > next_ts);
    assert_eq!(log.lock().len(), 1);
    sched.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_on_one_collection_run_concurrently() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let work = Duration::from_millis(200);
    let first = sched
        .submit(Recorder::new("q1", TaskKind::Query, "c", &log).work(work).boxed())
        .await
        .unwrap();
    let second = sched
        .submit(Recorder::new("q2", TaskKind::Query, "c", &log).work(work).boxed())
        .await
        .unwrap();
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    assert!(span(&log, "q1").overlaps(&span(&log, "q2")));
    sched.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ddl_never_overlaps_manipulation_on_the_same_collection() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let handles = vec![
        sched
            .submit(Recorder::new("m1", TaskKind::Manipulation, "c", &log).boxed())
            .await
            .unwrap(),
        sched
            .submit(Recorder::new("ddl", TaskKind::Ddl, "c", &log).boxed())
            .await
            .unwrap(),
        sched
            .submit(Recorder::new("q1", TaskKind::Query, "c", &log).boxed())
            .await
            .unwrap(),
    ];
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let ddl = span(&log, "ddl");
    assert!(!ddl.overlaps(&span(&log, "m1")));
    assert!(!ddl.overlaps(&span(&log, "q1")));
    sched.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ddl_and_manipulation_on_different_collections_run_concurrently() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let work = Duration::from_millis(200);
    let ddl = sched
        .submit(Recorder::new("ddl", TaskKind::Ddl, "x", &log).work(work).boxed())
        .await
        .unwrap();
    let insert = sched
        .submit(
            Recorder::new("insert", TaskKind::Manipulation, "y", &log)
                .work(work)
                .boxed(),
        )
        .await
        .unwrap();
    ddl.wait().await.unwrap();
    insert.wait().await.unwrap();

    assert!(span(&log, "ddl").overlaps(&span(&log, "insert")));
    sched.close().await;
}

#[tokio::test]
async fn pre_execute_failures_return_synchronously() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let mut recorder = Recorder::new("bad", TaskKind::Manipulation, "c", &log);
    recorder.reject = true;
    let result = sched.submit(recorder.boxed()).await;
    assert!(matches!(result, Err(Error::ValidationFailed { .. })));
    assert_eq!(sched.inflight(), 0);
    assert!(log.lock().is_empty());
    sched.close().await;
}

#[tokio::test]
async fn transient_execute_failures_are_retried() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let recorder = Recorder::new("flaky", TaskKind::Query, "c", &log);
    recorder.transient_failures.store(2, Ordering::SeqCst);
    let output = sched.submit(recorder.boxed()).await.unwrap().wait().await;
    assert_eq!(output.unwrap(), TaskOutput::Done);
    sched.close().await;
}

#[tokio::test]
async fn persistent_execute_failures_surface_as_execution_failed() {
    let log = Log::default();
    let sched = scheduler(SchedulerConfig {
        execute_attempts: 2,
        ..config()
    });
    sched.start();

    let recorder = Recorder::new("broken", TaskKind::Query, "c", &log);
    recorder.transient_failures.store(10, Ordering::SeqCst);
    let result = sched.submit(recorder.boxed()).await.unwrap().wait().await;
    assert!(matches!(
        result,
        Err(Error::ExecutionFailed { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn busy_exclusion_token_requeues_then_fails() {
    let log = Log::default();
    let sched = scheduler(SchedulerConfig {
        exclusion_wait: Duration::from_millis(20),
        max_requeues: 2,
        ..config()
    });
    let held = sched
        .inner
        .exclusion
        .acquire("c", Access::Exclusive, Duration::from_millis(10), &CancellationToken::new())
        .await
        .unwrap();
    assert!(held.is_some());
    sched.start();

    let result = sched
        .submit(Recorder::new("starved", TaskKind::Manipulation, "c", &log).boxed())
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(
        result,
        Err(Error::ExclusionTimeout { requeues: 2, .. })
    ));
    sched.close().await;
}

#[tokio::test]
async fn expired_deadline_leaves_the_task_running() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let handle = sched
        .submit(
            Recorder::new("slow", TaskKind::Query, "c", &log)
                .work(Duration::from_millis(300))
                .boxed(),
        )
        .await
        .unwrap();
    let task_id = handle.id();
    let result = handle.wait_for(Duration::from_millis(20)).await;
    assert!(matches!(result, Err(Error::Deadline { task_id: id }) if id == task_id));

    assert!(sched.drain(Duration::from_secs(2)).await);
    assert_eq!(log.lock().len(), 1);
    sched.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_with_enough_grace_finishes_every_task() {
    const TARGETS: [&str; 4] = ["a", "b", "c", "d"];
    let log = Log::default();
    let sched = scheduler(config());
    sched.start();

    let mut handles = Vec::with_capacity(100);
    for i in 0..100 {
        let recorder = Recorder::new("bulk", TaskKind::Manipulation, TARGETS[i % 4], &log)
            .work(Duration::from_millis(2));
        handles.push(sched.submit(recorder.boxed()).await.unwrap());
    }
    sched.stop_accepting();
    assert!(sched.drain(Duration::from_secs(10)).await);
    assert_eq!(sched.close().await, 0);

    let results = join_all(handles.into_iter().map(TaskHandle::wait)).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(log.lock().len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_past_grace_resolves_every_task() {
    let log = Log::default();
    let sched = scheduler(SchedulerConfig {
        manipulation: QueueConfig { max_active: 1 },
        ..config()
    });
    sched.start();

    let mut handles = Vec::with_capacity(100);
    for _ in 0..100 {
        let recorder = Recorder::new("bulk", TaskKind::Manipulation, "c", &log)
            .work(Duration::from_millis(20));
        handles.push(sched.submit(recorder.boxed()).await.unwrap());
    }
    sched.stop_accepting();
    assert!(!sched.drain(Duration::from_millis(50)).await);
    let abandoned = sched.close().await;
    assert!(abandoned > 0);

    let results = join_all(handles.into_iter().map(TaskHandle::wait)).await;
    let executed = results.iter().filter(|r| r.is_ok()).count();
    let shut_down = results
        .iter()
        .filter(|r| matches!(r, Err(Error::ServiceShutdown)))
        .count();
    assert_eq!(executed + shut_down, 100);
    assert_eq!(shut_down, abandoned);
}

#[tokio::test]
async fn submissions_after_stop_are_refused() {
    let log = Log::default();
    let sched = scheduler(config());
    sched.stop_accepting();
    let result = sched
        .submit(Recorder::new("late", TaskKind::Query, "c", &log).boxed())
        .await;
    assert!(matches!(result, Err(Error::ServiceShutdown)));
    assert_eq!(sched.inflight(), 0);
}

#[tokio::test]
async fn safe_timestamp_stays_below_unfinished_manipulation() {
    let log = Log::default();
    let sched = scheduler(config());

    let pending = sched
        .submit(Recorder::new("pending", TaskKind::Manipulation, "c", &log).boxed())
        .await
        .unwrap();
    assert_eq!(sched.queued(TaskKind::Manipulation), 1);
    assert_eq!(sched.safe_timestamp().await.unwrap(), pending.timestamp().prev());

    let pending_ts = pending.timestamp();
    sched.start();
    pending.wait().await.unwrap();
    assert!(sched.safe_timestamp().await.unwrap() > pending_ts);
    sched.close().await;
}
