//! Task execution for the jobs engine.
//!
//! - Handlers: typed tasks registered by task type
//! - Builtin: ingestion, metrics persistence, and spill replay tasks
//! - Pool: bounded-concurrency dispatch with retry and dead-lettering
//! - Results: TTL-bounded outcome store
//! - Producer: enqueue API
//! - Scheduler: leased periodic firing from the schedule register
//! - Monitor: read-only snapshot for operators

pub mod builtin;
pub mod config;
pub mod handler;
pub mod monitor;
pub mod pool;
pub mod producer;
pub mod results;
pub mod schedule_store;
pub mod scheduler;

pub use builtin::register_builtin;
pub use config::*;
pub use handler::{Handler, HandlerRegistry, Task, TaskContext};
pub use monitor::{LaneDepth, Monitor, MonitorSnapshot};
pub use pool::{Disposition, PoolStats, WorkerPool};
pub use producer::{EnqueueOptions, TaskProducer};
pub use results::ResultStore;
pub use schedule_store::{MemoryScheduleStore, ScheduleStore};
pub use scheduler::{NewSchedule, ScheduleUpdate, Scheduler, SchedulerStatus, TickReport};
