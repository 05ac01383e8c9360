//! Lifecycle of the gateway core.
//!
//! The [`Coordinator`] owns every component and is the single value the rest
//! of the process talks to. Startup goes leaves first:
//!
//! 1. Dial the authority.
//! 2. Warm the metadata cache.
//! 3. Create message-bus producers.
//! 4. Start the scheduler and the time tick.
//! 5. Start the allocators.
//! 6. Run start callbacks. The caller opens its endpoint after `start`
//!    returns.
//!
//! Shutdown runs the other way: stop accepting tasks, drain in-flight tasks
//! for the grace period, cancel everything still blocked, close allocators,
//! close the scheduler (failing what is still queued), close producers, then
//! run close callbacks.

use crate::{
    allocator::{IdAllocator, SegmentAllocator, TimestampAllocator},
    authority::{AuthorityConnector, SchemaChange},
    bus::{MessageBus, Producers},
    config::CoordinatorConfig,
    error::{Error, Result},
    meta::MetaCache,
    scheduler::{Task, TaskOutput, TaskScheduler},
    schema::CollectionSchema,
    tasks::{
        DdlTask, DeleteRequest, DeleteTask, InsertRequest, InsertTask, SearchRequest, SearchTask,
        Services,
    },
    timetick::TimeTicker,
    types::{SystemClock, TimeSource},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Starting,
    Running,
    Closing,
    Closed,
}

struct Components {
    ids: Arc<IdAllocator>,
    timestamps: Arc<TimestampAllocator>,
    segments: Arc<SegmentAllocator>,
    meta: Arc<MetaCache>,
    producers: Arc<Producers>,
    scheduler: Arc<TaskScheduler>,
    ticker: TimeTicker,
    services: Arc<Services>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    connector: Arc<dyn AuthorityConnector>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn TimeSource>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    /// Signalled when the lifecycle reaches `Closed`.
    closed: Notify,
    components: OnceLock<Components>,
    start_callbacks: Mutex<Vec<Callback>>,
    close_callbacks: Mutex<Vec<Callback>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        connector: Arc<dyn AuthorityConnector>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            config,
            connector,
            bus,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
            closed: Notify::new(),
            components: OnceLock::new(),
            start_callbacks: Mutex::new(Vec::new()),
            close_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the clock segment leases are checked against.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a callback run once at the end of [`start`](Self::start).
    pub fn add_start_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.start_callbacks.lock().push(Box::new(callback));
    }

    /// Registers a callback run once at the end of [`close`](Self::close).
    pub fn add_close_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.close_callbacks.lock().push(Box::new(callback));
    }

    /// Brings every component up in dependency order.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal: the authority dial, the cache warm-up or
    /// producer creation. A second call while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running => {
                    tracing::warn!("Coordinator already started");
                    return Ok(());
                }
                Lifecycle::Closing | Lifecycle::Closed => return Err(Error::ServiceShutdown),
            }
        }

        match self.bring_up().await {
            Ok(()) => {
                let running = {
                    let mut lifecycle = self.lifecycle.lock();
                    let running = *lifecycle == Lifecycle::Starting;
                    if running {
                        *lifecycle = Lifecycle::Running;
                    }
                    running
                };
                if !running {
                    tracing::warn!("Coordinator closed while starting; tearing down");
                    self.shut_down().await;
                    return Err(Error::ServiceShutdown);
                }
                run_callbacks(&self.start_callbacks, "start");
                tracing::info!("Coordinator started");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Coordinator failed to start: {e}");
                self.cancel.cancel();
                let close_requested = {
                    let mut lifecycle = self.lifecycle.lock();
                    let requested = *lifecycle == Lifecycle::Closing;
                    *lifecycle = Lifecycle::Closed;
                    requested
                };
                if close_requested {
                    run_callbacks(&self.close_callbacks, "close");
                }
                self.closed.notify_waiters();
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<()> {
        let authority = self.connector.connect().await?;

        let meta = Arc::new(MetaCache::new(Arc::clone(&authority)));
        meta.warm_up().await?;

        let producers = Arc::new(Producers::create(self.bus.as_ref(), &self.config.bus).await?);

        let ids = Arc::new(IdAllocator::new(
            Arc::clone(&authority),
            self.config.id_allocator.clone(),
            &self.cancel,
        ));
        let timestamps = Arc::new(TimestampAllocator::new(
            Arc::clone(&authority),
            self.config.timestamp_allocator.clone(),
            &self.cancel,
        ));
        let segments = Arc::new(SegmentAllocator::new(
            Arc::clone(&authority),
            Arc::clone(&self.clock),
            self.config.segment.clone(),
            &self.cancel,
        ));

        let scheduler = Arc::new(TaskScheduler::new(
            self.config.scheduler.clone(),
            Arc::clone(&ids),
            Arc::clone(&timestamps),
            &self.cancel,
        ));
        scheduler.start();
        let ticker = TimeTicker::new(
            Arc::clone(&scheduler),
            Arc::clone(producers.timetick()),
            self.config.time_tick_interval,
            &self.cancel,
        );
        ticker.start();

        ids.start();
        timestamps.start();
        segments.start();

        let services = Arc::new(Services {
            authority,
            ids: Arc::clone(&ids),
            segments: Arc::clone(&segments),
            meta: Arc::clone(&meta),
            producers: Arc::clone(&producers),
            bus: self.config.bus.clone(),
        });
        let components = Components {
            ids,
            timestamps,
            segments,
            meta,
            producers,
            scheduler,
            ticker,
            services,
        };
        if self.components.set(components).is_err() {
            return Err(Error::ChannelError {
                context: "coordinator components were already installed".to_string(),
            });
        }
        Ok(())
    }

    /// Tears everything down in reverse order. Failures along the way are
    /// logged and skipped so the sequence always completes.
    ///
    /// Called while [`start`](Self::start) is still running, it cancels the
    /// startup and returns once the partially started core is torn down.
    pub async fn close(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            let previous = *lifecycle;
            match previous {
                Lifecycle::Running | Lifecycle::Starting => *lifecycle = Lifecycle::Closing,
                Lifecycle::Created => *lifecycle = Lifecycle::Closed,
                Lifecycle::Closing | Lifecycle::Closed => {}
            }
            previous
        };
        match previous {
            Lifecycle::Running => self.shut_down().await,
            Lifecycle::Created => run_callbacks(&self.close_callbacks, "close"),
            Lifecycle::Starting => {
                tracing::warn!("Coordinator closed while starting");
                self.cancel.cancel();
                self.wait_closed().await;
            }
            Lifecycle::Closing => self.wait_closed().await,
            Lifecycle::Closed => {}
        }
    }

    async fn shut_down(&self) {
        tracing::info!("Coordinator shutting down");

        if let Some(c) = self.components.get() {
            c.scheduler.stop_accepting();
            let grace = self.config.shutdown_grace;
            if !c.scheduler.drain(grace).await {
                tracing::warn!(
                    inflight = c.scheduler.inflight(),
                    ?grace,
                    "Grace period elapsed with tasks in flight"
                );
            }

            self.cancel.cancel();
            c.ticker.stop().await;

            c.ids.close().await;
            c.timestamps.close().await;
            c.segments.close().await;

            let abandoned = c.scheduler.close().await;
            c.producers.close_all().await;
            tracing::info!(abandoned, "Coordinator components closed");
        }

        *self.lifecycle.lock() = Lifecycle::Closed;
        run_callbacks(&self.close_callbacks, "close");
        self.closed.notify_waiters();
        tracing::info!("Coordinator shut down");
    }

    async fn wait_closed(&self) {
        loop {
            let closed = self.closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if *self.lifecycle.lock() == Lifecycle::Closed {
                return;
            }
            closed.await;
        }
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn components(&self) -> Result<&Components> {
        match *self.lifecycle.lock() {
            Lifecycle::Running => {}
            Lifecycle::Closing | Lifecycle::Closed => return Err(Error::ServiceShutdown),
            Lifecycle::Created | Lifecycle::Starting => {
                return Err(Error::NotStarted {
                    component: "coordinator",
                });
            }
        }
        self.components.get().ok_or(Error::NotStarted {
            component: "coordinator",
        })
    }

    pub fn scheduler(&self) -> Result<Arc<TaskScheduler>> {
        Ok(Arc::clone(&self.components()?.scheduler))
    }

    pub fn id_allocator(&self) -> Result<Arc<IdAllocator>> {
        Ok(Arc::clone(&self.components()?.ids))
    }

    pub fn timestamp_allocator(&self) -> Result<Arc<TimestampAllocator>> {
        Ok(Arc::clone(&self.components()?.timestamps))
    }

    pub fn segment_allocator(&self) -> Result<Arc<SegmentAllocator>> {
        Ok(Arc::clone(&self.components()?.segments))
    }

    pub fn meta_cache(&self) -> Result<Arc<MetaCache>> {
        Ok(Arc::clone(&self.components()?.meta))
    }

    /// Components shared by tasks, for building custom ones.
    pub fn services(&self) -> Result<Arc<Services>> {
        Ok(Arc::clone(&self.components()?.services))
    }

    /// Submits a task and waits for its outcome. The whole request,
    /// `pre_execute` included, gets at most `deadline` (the configured
    /// request timeout when `None`).
    ///
    /// # Errors
    ///
    /// Submission errors come back as is. A deadline expiring before the
    /// task is queued yields [`Error::Deadline`] and the task never runs;
    /// one expiring later yields the same error while the task keeps
    /// running.
    pub async fn submit(&self, task: Box<dyn Task>, deadline: Option<Duration>) -> Result<TaskOutput> {
        let scheduler = self.scheduler()?;
        let deadline = Instant::now() + deadline.unwrap_or(self.config.request_timeout);
        let handle = scheduler.submit_before(task, deadline).await?;
        handle.wait_until(deadline).await
    }

    async fn schema_change(&self, change: SchemaChange, deadline: Option<Duration>) -> Result<TaskOutput> {
        let task = DdlTask::new(self.services()?, change);
        self.submit(Box::new(task), deadline).await
    }

    pub async fn create_collection(
        &self,
        schema: CollectionSchema,
        deadline: Option<Duration>,
    ) -> Result<TaskOutput> {
        self.schema_change(SchemaChange::CreateCollection { schema }, deadline)
            .await
    }

    pub async fn drop_collection(&self, collection: &str, deadline: Option<Duration>) -> Result<TaskOutput> {
        let change = SchemaChange::DropCollection {
            collection: collection.to_string(),
        };
        self.schema_change(change, deadline).await
    }

    pub async fn create_partition(
        &self,
        collection: &str,
        partition: &str,
        deadline: Option<Duration>,
    ) -> Result<TaskOutput> {
        let change = SchemaChange::CreatePartition {
            collection: collection.to_string(),
            partition: partition.to_string(),
        };
        self.schema_change(change, deadline).await
    }

    pub async fn drop_partition(
        &self,
        collection: &str,
        partition: &str,
        deadline: Option<Duration>,
    ) -> Result<TaskOutput> {
        let change = SchemaChange::DropPartition {
            collection: collection.to_string(),
            partition: partition.to_string(),
        };
        self.schema_change(change, deadline).await
    }

    pub async fn insert(&self, request: InsertRequest, deadline: Option<Duration>) -> Result<TaskOutput> {
        let task = InsertTask::new(self.services()?, request);
        self.submit(Box::new(task), deadline).await
    }

    pub async fn delete(&self, request: DeleteRequest, deadline: Option<Duration>) -> Result<TaskOutput> {
        let task = DeleteTask::new(self.services()?, request);
        self.submit(Box::new(task), deadline).await
    }

    pub async fn search(&self, request: SearchRequest, deadline: Option<Duration>) -> Result<TaskOutput> {
        let task = SearchTask::new(self.services()?, request);
        self.submit(Box::new(task), deadline).await
    }
}

fn run_callbacks(callbacks: &Mutex<Vec<Callback>>, phase: &'static str) {
    let callbacks = core::mem::take(&mut *callbacks.lock());
    let count = callbacks.len();
    for callback in callbacks {
        callback();
    }
    if count > 0 {
        tracing::debug!(phase, count, "Ran lifecycle callbacks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authority::{Authority, LocalAuthority},
        bus::InMemoryBus,
        config::BusConfig,
        schema::{DataType, FieldSchema, FieldValue, Row},
        tasks::InsertRecord,
    };
    use futures::future::join_all;

    struct Unreachable;

    #[tonic::async_trait]
    impl AuthorityConnector for Unreachable {
        async fn connect(&self) -> Result<Arc<dyn Authority>> {
            Err(tonic::Status::unavailable("no route to authority").into())
        }
    }

    struct SlowDial(LocalAuthority);

    #[tonic::async_trait]
    impl AuthorityConnector for SlowDial {
        async fn connect(&self) -> Result<Arc<dyn Authority>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Arc::new(self.0.clone()))
        }
    }

    fn schema(name: &str) -> CollectionSchema {
        CollectionSchema {
            name: name.into(),
            description: "test".into(),
            fields: vec![
                FieldSchema {
                    name: "pk".into(),
                    data_type: DataType::Int64,
                    is_primary: true,
                },
                FieldSchema {
                    name: "embedding".into(),
                    data_type: DataType::FloatVector { dim: 3 },
                    is_primary: false,
                },
            ],
        }
    }

    fn rows(keys: core::ops::Range<i64>) -> Vec<Row> {
        keys.map(|pk| {
            Row::from([
                ("pk".to_string(), FieldValue::Int64(pk)),
                ("embedding".to_string(), FieldValue::FloatVector(vec![0.0, 1.0, 2.0])),
            ])
        })
        .collect()
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            time_tick_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            ..CoordinatorConfig::default()
        }
    }

    fn coordinator(authority: &LocalAuthority, bus: &InMemoryBus) -> Coordinator {
        Coordinator::new(config(), Arc::new(authority.clone()), Arc::new(bus.clone()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn operations_flow_through_to_the_bus() {
        let bus = InMemoryBus::new();
        let coordinator = coordinator(&LocalAuthority::default(), &bus);
        coordinator.start().await.unwrap();

        coordinator.create_collection(schema("docs"), None).await.unwrap();
        coordinator.create_partition("docs", "recent", None).await.unwrap();
        let inserted = coordinator
            .insert(
                InsertRequest {
                    collection: "docs".into(),
                    partition: Some("recent".into()),
                    rows: rows(0..5),
                },
                None,
            )
            .await
            .unwrap();
        assert!(matches!(inserted, TaskOutput::Inserted { row_count: 5, .. }));

        coordinator
            .delete(
                DeleteRequest {
                    collection: "docs".into(),
                    partition: None,
                    primary_keys: vec![1, 2],
                },
                None,
            )
            .await
            .unwrap();
        coordinator
            .search(
                SearchRequest {
                    collection: "docs".into(),
                    partitions: vec!["recent".into()],
                    field: "embedding".into(),
                    vectors: vec![vec![1.0, 1.0, 1.0]],
                    top_k: 3,
                },
                None,
            )
            .await
            .unwrap();

        let manipulation = bus.messages("manipulation-0");
        assert_eq!(manipulation.len(), 2);
        assert!(manipulation[0].timestamp < manipulation[1].timestamp);
        let record: InsertRecord = manipulation[0].decode().unwrap();
        assert_eq!(record.rows.len(), 5);
        assert_eq!(bus.messages(BusConfig::QUERY_CHANNEL).len(), 1);

        coordinator.drop_partition("docs", "recent", None).await.unwrap();
        coordinator.drop_collection("docs", None).await.unwrap();
        coordinator.close().await;
    }

    #[tokio::test]
    async fn startup_warms_the_cache_and_runs_callbacks_in_order() {
        let authority = LocalAuthority::default();
        authority
            .apply_schema_change(SchemaChange::CreateCollection {
                schema: schema("existing"),
            })
            .await
            .unwrap();
        let coordinator = coordinator(&authority, &InMemoryBus::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        for (name, start) in [("start-1", true), ("start-2", true), ("close-1", false)] {
            let events = Arc::clone(&events);
            let callback = move || events.lock().push(name);
            if start {
                coordinator.add_start_callback(callback);
            } else {
                coordinator.add_close_callback(callback);
            }
        }

        coordinator.start().await.unwrap();
        assert_eq!(coordinator.meta_cache().unwrap().len(), 1);
        assert_eq!(*events.lock(), vec!["start-1", "start-2"]);

        coordinator.close().await;
        assert_eq!(*events.lock(), vec!["start-1", "start-2", "close-1"]);
    }

    #[tokio::test]
    async fn unreachable_authority_fails_startup() {
        let coordinator = Coordinator::new(
            config(),
            Arc::new(Unreachable),
            Arc::new(InMemoryBus::new()),
        );
        assert!(matches!(
            coordinator.start().await,
            Err(Error::Authority { .. })
        ));
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn requests_before_start_and_after_close_are_refused() {
        let coordinator = coordinator(&LocalAuthority::default(), &InMemoryBus::new());
        assert!(matches!(
            coordinator.drop_collection("docs", None).await,
            Err(Error::NotStarted { .. })
        ));

        coordinator.start().await.unwrap();
        coordinator.close().await;
        assert!(matches!(
            coordinator.drop_collection("docs", None).await,
            Err(Error::ServiceShutdown)
        ));
        assert!(matches!(coordinator.start().await, Err(Error::ServiceShutdown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_resolves_every_submitted_insert() {
        let bus = InMemoryBus::new();
        let coordinator = coordinator(&LocalAuthority::default(), &bus);
        coordinator.start().await.unwrap();
        coordinator.create_collection(schema("docs"), None).await.unwrap();

        let scheduler = coordinator.scheduler().unwrap();
        let services = coordinator.services().unwrap();
        let mut handles = Vec::with_capacity(100);
        for i in 0..100 {
            let task = InsertTask::new(
                Arc::clone(&services),
                InsertRequest {
                    collection: "docs".into(),
                    partition: None,
                    rows: rows(i..i + 1),
                },
            );
            handles.push(scheduler.submit(Box::new(task)).await.unwrap());
        }
        coordinator.close().await;

        let results = join_all(handles.into_iter().map(|h| h.wait())).await;
        let executed = results.iter().filter(|r| r.is_ok()).count();
        let shut_down = results
            .iter()
            .filter(|r| matches!(r, Err(Error::ServiceShutdown)))
            .count();
        assert_eq!(executed + shut_down, 100);
        assert_eq!(bus.messages("manipulation-0").len(), executed);
    }

    #[tokio::test]
    async fn short_deadlines_report_deadline_errors() {
        let authority = LocalAuthority::default();
        let coordinator = coordinator(&authority, &InMemoryBus::new());
        coordinator.start().await.unwrap();
        coordinator.create_collection(schema("docs"), None).await.unwrap();

        authority.set_latency(Duration::from_millis(200));
        let result = coordinator
            .drop_collection("docs", Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(result, Err(Error::Deadline { .. })));
        authority.set_latency(Duration::ZERO);
        coordinator.close().await;
    }

    #[tokio::test]
    async fn deadlines_cover_work_before_the_task_is_queued() {
        let authority = LocalAuthority::default();
        let coordinator = coordinator(&authority, &InMemoryBus::new());
        coordinator.start().await.unwrap();
        // Created behind the coordinator's back, so the first insert has to
        // describe it.
        authority
            .apply_schema_change(SchemaChange::CreateCollection {
                schema: schema("cold"),
            })
            .await
            .unwrap();

        authority.set_latency(Duration::from_millis(1_500));
        let started = Instant::now();
        let result = coordinator
            .insert(
                InsertRequest {
                    collection: "cold".into(),
                    partition: None,
                    rows: rows(0..1),
                },
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(Error::Deadline { .. })));
        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(coordinator.scheduler().unwrap().inflight(), 0);

        authority.set_latency(Duration::ZERO);
        coordinator.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn closing_during_startup_tears_the_core_down() {
        let coordinator = Arc::new(Coordinator::new(
            config(),
            Arc::new(SlowDial(LocalAuthority::default())),
            Arc::new(InMemoryBus::new()),
        ));
        let closed = Arc::new(Mutex::new(false));
        {
            let closed = Arc::clone(&closed);
            coordinator.add_close_callback(move || *closed.lock() = true);
        }

        let starting = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.close().await;

        assert!(*closed.lock());
        assert!(!coordinator.is_running());
        assert!(matches!(starting.await.unwrap(), Err(Error::ServiceShutdown)));
        assert!(matches!(coordinator.scheduler(), Err(Error::ServiceShutdown)));
    }
}
