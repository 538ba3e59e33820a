//! Periodic metrics aggregation published to a shared memory region.
//!
//! Producer threads [`put`](collector::Collector::put) fixed-capacity
//! [`TaskPack`]s tagged with a category id. One collector context drains
//! them into an [`Aggregator`] and, once per interval, marshals the aggregate
//! into a flat integer array written to a [`Sink`].

pub mod agent;
pub mod aggregator;
pub mod clock;
pub mod collector;
pub mod config;
pub mod export;
pub mod queue;
pub mod sink;
pub mod task;

pub use aggregator::{Aggregator, SchemaAggregator};
pub use collector::{Collector, Phase, RunError, ThreadingMode};
pub use sink::{SharedMemorySink, Sink, SinkError};
pub use task::{CategoryId, Task, TaskError, TaskPack};
