//! Job scheduler façade.
//!
//! The scheduler owns three bounded queues (pending, waiting, completed), the
//! job and dependency-link pools, and the worker threads. Job records live in
//! the pool behind one coordination lock; queues only carry small entries and
//! have their own locks, so no lock is held while a job runs.
//!
//! Lock order is coordination lock, then queue lock. Workers pop from the
//! pending queue without the coordination lock and take it afterwards.
//!
//! Workers never block on the completed queue. A finished job that finds it
//! full is parked in an overflow list that the drain reads after the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alloc::{AllocError, CategoryAllocator, CountingAllocator, MemoryCategory};
use crate::config::{ConfigError, SchedulerConfig};
use crate::job::{
    CompletedJob, DependencyLink, JobDesc, JobFailure, JobId, JobLocation, JobRecord, JobStatus,
    OwnerId, QueuedJob,
};
use crate::observability::{Counters, SchedulerTelemetry};
use crate::pool::Pool;
use crate::queue::{BlockingQueue, QueueError, QueueKind, QueueOrdering};
use crate::worker;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown or freed job {0}")]
    UnknownJob(JobId),
    #[error("{0} was already submitted")]
    AlreadySubmitted(JobId),
    #[error("{0} is already scheduled; dependencies can only be added before submit or while it waits")]
    DependentAlreadyScheduled(JobId),
    #[error("{0} cannot depend on itself")]
    SelfDependency(JobId),
    #[error("{dependent} depending on {dependency} would form a cycle")]
    DependencyCycle { dependent: JobId, dependency: JobId },
    #[error("{0} is queued or running and cannot be freed")]
    JobInFlight(JobId),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub(crate) struct SchedulerState {
    pub jobs: Pool<JobRecord>,
    pub links: Pool<DependencyLink>,
    // Dependents whose counter hit zero while the pending queue was full.
    pub deferred: VecDeque<QueuedJob>,
    // Finished jobs that found the completed queue full. Non-empty only while
    // every queued entry is older than every parked one.
    pub overflow: VecDeque<QueuedJob>,
    pub next_serial: u64,
}

pub(crate) struct SchedulerShared {
    pub state: Mutex<SchedulerState>,
    pub terminal: Condvar,
    pub pending: BlockingQueue<QueuedJob>,
    pub waiting: BlockingQueue<QueuedJob>,
    pub completed: BlockingQueue<QueuedJob>,
    pub shutting_down: AtomicBool,
    pub counters: Counters,
}

impl SchedulerShared {
    pub fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler state lock poisoned")
    }

    pub fn publish_completed(&self, state: &mut SchedulerState, entry: QueuedJob) {
        if state.overflow.is_empty() {
            match self.completed.push(entry, entry.priority) {
                Ok(()) | Err(QueueError::Closed(_)) => return,
                Err(QueueError::Full(_)) => {
                    tracing::debug!(job = %entry.id, "completed queue full, parking entry");
                }
            }
        }
        state.overflow.push_back(entry);
    }

    pub fn take_completed(&self, state: &mut SchedulerState, owner: OwnerId) -> Option<QueuedJob> {
        if let Some(entry) = self.completed.pop_matching(|queued| queued.owner == owner) {
            return Some(entry);
        }
        let position = state.overflow.iter().position(|queued| queued.owner == owner)?;
        state.overflow.remove(position)
    }
}

pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    allocator: Arc<dyn CategoryAllocator>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, JobError> {
        Self::with_allocator(config, Arc::new(CountingAllocator::new()))
    }

    pub fn with_allocator(
        config: SchedulerConfig,
        allocator: Arc<dyn CategoryAllocator>,
    ) -> Result<Self, JobError> {
        config.validate()?;
        let jobs = Pool::with_prewarm(
            MemoryCategory::JobRecords,
            Arc::clone(&allocator),
            config.prewarm_jobs,
        )?;
        let links = Pool::with_prewarm(
            MemoryCategory::DependencyLinks,
            Arc::clone(&allocator),
            config.prewarm_links,
        )?;
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                jobs,
                links,
                deferred: VecDeque::new(),
                overflow: VecDeque::new(),
                next_serial: 0,
            }),
            terminal: Condvar::new(),
            pending: BlockingQueue::new(
                QueueKind::Pending,
                config.pending_capacity,
                config.ordering,
            ),
            waiting: BlockingQueue::new(
                QueueKind::Waiting,
                config.waiting_capacity,
                QueueOrdering::Fifo,
            ),
            completed: BlockingQueue::new(
                QueueKind::Completed,
                config.completed_capacity,
                QueueOrdering::Fifo,
            ),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let worker_count = config.resolved_worker_count();
        let scheduler = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
            allocator,
        };
        {
            let mut handles = scheduler.workers.lock().expect("workers lock poisoned");
            for index in 0..worker_count {
                // On failure the scheduler's Drop joins whatever already started.
                handles.push(worker::spawn_worker(&shared, index)?);
            }
        }
        tracing::info!(
            workers = worker_count,
            pending_capacity = config.pending_capacity,
            ordering = ?config.ordering,
            "job scheduler started"
        );
        Ok(scheduler)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn allocator(&self) -> Arc<dyn CategoryAllocator> {
        Arc::clone(&self.allocator)
    }

    pub fn pending_capacity(&self) -> usize {
        self.shared.pending.capacity()
    }

    pub fn create_job(&self, desc: JobDesc) -> Result<JobId, JobError> {
        self.create_owned_job(OwnerId::DIRECT, desc)
    }

    pub(crate) fn create_owned_job(&self, owner: OwnerId, desc: JobDesc) -> Result<JobId, JobError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(JobError::ShuttingDown);
        }
        let mut state = self.shared.lock_state();
        state.next_serial += 1;
        let serial = state.next_serial;
        let key = state.jobs.create(JobRecord::new(serial, owner, desc))?;
        Ok(JobId(key))
    }

    // On a full queue the job stays unsubmitted and the caller may retry.
    pub fn submit(&self, id: JobId) -> Result<(), JobError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(JobError::ShuttingDown);
        }
        let mut state = self.shared.lock_state();
        let record = state.jobs.get_mut(id.0).ok_or(JobError::UnknownJob(id))?;
        if record.location != JobLocation::Unsubmitted {
            return Err(JobError::AlreadySubmitted(id));
        }
        let entry = record.entry(id);
        // Cancelled jobs skip the wait and settle on the next pop.
        let ready = record.unresolved == 0 || record.status == JobStatus::Cancelled;
        let (queue, location) = if ready {
            (&self.shared.pending, JobLocation::Pending)
        } else {
            (&self.shared.waiting, JobLocation::Waiting)
        };
        if let Err(err) = queue.push(entry, entry.priority) {
            tracing::warn!(job = %id, error = %err, "job submission rejected");
            return Err(err.into());
        }
        record.location = location;
        Ok(())
    }

    pub fn spawn(&self, desc: JobDesc) -> Result<JobId, JobError> {
        let id = self.create_job(desc)?;
        if let Err(err) = self.submit(id) {
            let _ = self.free_job(id);
            return Err(err);
        }
        Ok(id)
    }

    // Returns false once the job is running or finished; running jobs always
    // run to completion.
    pub fn cancel(&self, id: JobId) -> Result<bool, JobError> {
        let mut state = self.shared.lock_state();
        if !state.jobs.contains(id.0) {
            return Err(JobError::UnknownJob(id));
        }
        Ok(self.shared.mark_cancelled(&mut state, id, None))
    }

    pub fn add_dependency(&self, dependent: JobId, dependency: JobId) -> Result<bool, JobError> {
        let mut state = self.shared.lock_state();
        self.shared.link_dependency(&mut state, dependent, dependency)
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        let state = self.shared.lock_state();
        state.jobs.get(id.0).map(|record| record.status)
    }

    pub fn failure(&self, id: JobId) -> Option<JobFailure> {
        let state = self.shared.lock_state();
        state.jobs.get(id.0).and_then(|record| record.failure.clone())
    }

    pub fn serial(&self, id: JobId) -> Option<u64> {
        let state = self.shared.lock_state();
        state.jobs.get(id.0).map(|record| record.serial)
    }

    // A freed job counts as finished. A terminal job is already drainable.
    pub fn wait(&self, id: JobId, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock_state();
        loop {
            match state.jobs.get(id.0) {
                None => return true,
                Some(record) if record.status.is_terminal() => return true,
                Some(_) => {}
            }
            state = match deadline {
                None => self
                    .shared
                    .terminal
                    .wait(state)
                    .expect("scheduler state lock poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .shared
                        .terminal
                        .wait_timeout(state, deadline - now)
                        .expect("scheduler state lock poisoned");
                    guard
                }
            };
        }
    }

    pub fn drain_completed<F>(&self, max: usize, on_job: F) -> usize
    where
        F: FnMut(CompletedJob),
    {
        self.drain_owned(OwnerId::DIRECT, max, on_job)
    }

    pub(crate) fn drain_owned<F>(&self, owner: OwnerId, max: usize, mut on_job: F) -> usize
    where
        F: FnMut(CompletedJob),
    {
        let mut drained = 0usize;
        while max == 0 || drained < max {
            let (entry, record) = {
                let mut state = self.shared.lock_state();
                let Some(entry) = self.shared.take_completed(&mut state, owner) else {
                    break;
                };
                let record = state.jobs.destroy(entry.id.0);
                (entry, record)
            };
            let Some(record) = record else {
                tracing::warn!(job = %entry.id, "completed entry without a job record");
                continue;
            };
            drained += 1;
            on_job(CompletedJob {
                id: entry.id,
                serial: record.serial,
                status: record.status,
                failure: record.failure,
                context: record.context,
                detached: record.detached,
            });
        }
        drained
    }

    // Dependents of a job freed before it ran are cancelled.
    pub fn free_job(&self, id: JobId) -> Result<(), JobError> {
        let mut state = self.shared.lock_state();
        let record = state.jobs.get(id.0).ok_or(JobError::UnknownJob(id))?;
        if record.location != JobLocation::Unsubmitted {
            return Err(JobError::JobInFlight(id));
        }
        self.shared.release_unsubmitted(&mut state, id);
        Ok(())
    }

    // Cuts the creator's tie to a job. An unsubmitted job is released at
    // once (returns true); anything further along is cancelled if it has not
    // started and released by the next drain without reporting back.
    pub(crate) fn detach_job(&self, id: JobId) -> bool {
        let mut state = self.shared.lock_state();
        let Some(record) = state.jobs.get_mut(id.0) else {
            return false;
        };
        if record.location == JobLocation::Unsubmitted {
            self.shared.release_unsubmitted(&mut state, id);
            return true;
        }
        record.detached = true;
        record.context = None;
        self.shared.mark_cancelled(&mut state, id, None);
        false
    }

    pub fn telemetry(&self) -> SchedulerTelemetry {
        let mut telemetry = {
            let state = self.shared.lock_state();
            SchedulerTelemetry {
                deferred: state.deferred.len(),
                completed_overflow: state.overflow.len(),
                live_jobs: state.jobs.len(),
                live_links: state.links.len(),
                ..SchedulerTelemetry::default()
            }
        };
        telemetry.pending_depth = self.shared.pending.len();
        telemetry.waiting_depth = self.shared.waiting.len();
        telemetry.completed_depth = self.shared.completed.len();
        telemetry.workers = self.worker_count;
        self.shared.counters.fill(&mut telemetry);
        telemetry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.pending.shutdown();
        self.shared.waiting.shutdown();
        self.shared.completed.shutdown();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain(..).collect()
        };
        let mut panicked = 0usize;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        let dropped = {
            let mut state = self.shared.lock_state();
            let dropped = self.shared.pending.drain().len()
                + self.shared.waiting.drain().len()
                + self.shared.completed.drain().len()
                + state.overflow.len();
            state.deferred.clear();
            state.overflow.clear();
            state.links.clear();
            state.jobs.clear();
            dropped
        };
        self.shared.terminal.notify_all();
        if panicked > 0 {
            tracing::warn!(panicked, "worker threads panicked");
        }
        tracing::info!(dropped, "job scheduler shut down");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
