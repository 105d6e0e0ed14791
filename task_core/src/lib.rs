#![forbid(unsafe_code)]

pub mod alloc;
pub mod config;
mod graph;
pub mod job;
pub mod logging;
pub mod observability;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod tasks;
mod worker;

pub use crate::alloc::{AllocError, CategoryAllocator, CountingAllocator, MemoryCategory, MemoryStats};
pub use crate::config::{ConfigError, SchedulerConfig};
pub use crate::job::{
    CompletedJob, JobContext, JobDesc, JobFailure, JobId, JobPriority, JobStatus, OwnerId,
};
pub use crate::observability::SchedulerTelemetry;
pub use crate::queue::{QueueError, QueueKind, QueueOrdering};
pub use crate::scheduler::{JobError, JobScheduler};
pub use crate::tasks::{
    CompletedTask, LoaderRegistry, TaskError, TaskHandle, TaskKind, TaskOutput, TaskRequest,
    TaskSystem,
};
