//! # `keystone`: allocation and scheduling core of a gateway node
//!
//! `keystone` accepts client operations, gives them cluster-wide identifiers
//! and timestamps leased in batches from a central authority, orders them,
//! and drives each one through a three-phase execution protocol before
//! handing the result to a publish/subscribe message bus.
//!
//! ## Module Overview
//!
//! - [`allocator`] - Batch-leasing allocators for identifiers, timestamps and
//!   segment row slots.
//! - [`scheduler`] - Task queues, the per-collection exclusion table and the
//!   worker loops that advance tasks through `PreExecute`/`Execute`/
//!   `PostExecute`.
//! - [`tasks`] - Concrete DDL, manipulation and query tasks.
//! - [`coordinator`] - Ordered startup and graceful shutdown of everything
//!   above.
//! - [`authority`] - The authority contract plus an in-process and a gRPC
//!   implementation.
//! - [`bus`] - Message-bus producers (in-memory and gRPC).
//! - [`meta`] - Collection metadata cache.
//! - [`timetick`] - Periodic time-tick publication.
//!
//! ## Invariants
//!
//! - A value handed out by an allocator is never handed out again, even across
//!   restarts, because the authority keeps the high-water mark.
//! - Timestamps from one [`TimestampAllocator`] are strictly increasing in
//!   issuance order.
//! - Tasks on the same queue and collection reach `Execute` in timestamp
//!   order; DDL never overlaps manipulation or query on the same collection.

pub mod allocator;
pub mod authority;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod meta;
pub mod proto;
pub mod scheduler;
pub mod schema;
pub mod tasks;
pub mod timetick;
pub mod types;

pub use allocator::{
    AllocationRange, BatchAllocator, IdAllocator, SegmentAllocator, SegmentAssignment,
    TimestampAllocator,
};
pub use authority::{Authority, AuthorityConnector, LocalAuthority, SegmentLease};
pub use bus::{BusMessage, InMemoryBus, MessageBus, Producer};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use scheduler::{TaskHandle, TaskKind, TaskOutput, TaskScheduler, TaskState};
pub use types::{SystemClock, TimeSource, Timestamp, UniqueId};
