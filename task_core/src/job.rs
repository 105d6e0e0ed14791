use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pool::PoolKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    pub(crate) fn lane(self) -> usize {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobId(pub(crate) PoolKey);

impl JobId {
    pub fn key(self) -> PoolKey {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub const DIRECT: OwnerId = OwnerId(0);

    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        OwnerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobContext(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFailure {
    pub code: i32,
    pub message: String,
}

impl JobFailure {
    pub const CODE_ERROR: i32 = 1;
    pub const CODE_PANIC: i32 = -1;
    pub const CODE_DEPENDENCY: i32 = -2;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Self::CODE_ERROR, message)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

pub type JobFn = Box<dyn FnOnce() -> Result<(), JobFailure> + Send + 'static>;
pub type ErrorHandler = Box<dyn FnOnce(&JobFailure) + Send + 'static>;

pub struct JobDesc {
    pub(crate) priority: JobPriority,
    pub(crate) work: JobFn,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) context: Option<JobContext>,
}

impl JobDesc {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<(), JobFailure> + Send + 'static,
    {
        Self {
            priority: JobPriority::Normal,
            work: Box::new(work),
            on_error: None,
            context: None,
        }
    }

    pub fn from_fn<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            work();
            Ok(())
        })
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_error<H>(mut self, handler: H) -> Self
    where
        H: FnOnce(&JobFailure) + Send + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    pub fn context(mut self, context: JobContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobLocation {
    Unsubmitted,
    Pending,
    Waiting,
    Running,
    Completed,
}

pub(crate) struct JobRecord {
    pub serial: u64,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub location: JobLocation,
    pub owner: OwnerId,
    pub context: Option<JobContext>,
    pub detached: bool,
    pub work: Option<JobFn>,
    pub on_error: Option<ErrorHandler>,
    pub failure: Option<JobFailure>,
    pub unresolved: u32,
    pub dependents: Option<PoolKey>,
}

impl JobRecord {
    pub fn new(serial: u64, owner: OwnerId, desc: JobDesc) -> Self {
        Self {
            serial,
            priority: desc.priority,
            status: JobStatus::Pending,
            location: JobLocation::Unsubmitted,
            owner,
            context: desc.context,
            detached: false,
            work: Some(desc.work),
            on_error: desc.on_error,
            failure: None,
            unresolved: 0,
            dependents: None,
        }
    }

    pub fn entry(&self, id: JobId) -> QueuedJob {
        QueuedJob {
            id,
            owner: self.owner,
            priority: self.priority,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueuedJob {
    pub id: JobId,
    pub owner: OwnerId,
    pub priority: JobPriority,
}

pub(crate) struct DependencyLink {
    pub dependent: JobId,
    pub next: Option<PoolKey>,
}

#[derive(Debug)]
pub struct CompletedJob {
    pub id: JobId,
    pub serial: u64,
    pub status: JobStatus,
    pub failure: Option<JobFailure>,
    pub context: Option<JobContext>,
    pub detached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_low_to_critical() {
        let mut priorities = vec![
            JobPriority::Critical,
            JobPriority::Low,
            JobPriority::High,
            JobPriority::Normal,
        ];
        priorities.sort();
        assert_eq!(priorities, JobPriority::ALL.to_vec());
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn owner_ids_are_unique_and_never_direct() {
        let a = OwnerId::allocate();
        let b = OwnerId::allocate();
        assert_ne!(a, b);
        assert_ne!(a, OwnerId::DIRECT);
    }

    #[test]
    fn from_fn_wraps_infallible_work() {
        let desc = JobDesc::from_fn(|| {}).priority(JobPriority::High);
        assert_eq!(desc.priority, JobPriority::High);
        assert_eq!((desc.work)(), Ok(()));
    }
}
