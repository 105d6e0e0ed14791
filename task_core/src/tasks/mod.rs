//! Typed loading tasks on top of the job scheduler.
//!
//! Each task owns one job and one slot in a generational handle table. The
//! job runs the loader for the task's kind on a worker and parks the result
//! in a cell shared with the slot. `process_completed_tasks` is the only
//! place completion callbacks run: it drains this system's finished jobs on
//! the caller's thread, records their terminal status in the slot and hands
//! the job record back to the scheduler. Freeing a task recycles its slot,
//! so handles kept past `free_task` stop resolving.

pub mod loaders;
pub mod payload;

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::alloc::{AllocError, CategoryAllocator, MemoryCategory};
use crate::job::{CompletedJob, JobContext, JobDesc, JobFailure, JobId, JobPriority, JobStatus, OwnerId};
use crate::pool::{Pool, PoolKey};
use crate::scheduler::{JobError, JobScheduler};

pub use loaders::LoaderRegistry;
pub use payload::{MaterialData, MeshData, TaskKind, TaskOutput, TaskRequest, Texture};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(PoolKey);

impl TaskHandle {
    pub fn key(self) -> PoolKey {
        self.0
    }

    fn context(self) -> JobContext {
        JobContext(self.0.to_bits())
    }

    fn from_context(context: JobContext) -> Self {
        TaskHandle(PoolKey::from_bits(context.0))
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0} does not refer to a live task")]
    StaleHandle(TaskHandle),
    #[error("{handle} has not completed (status {status})")]
    NotCompleted { handle: TaskHandle, status: JobStatus },
    #[error("{handle} is a {actual} task, not {expected}")]
    KindMismatch {
        handle: TaskHandle,
        expected: TaskKind,
        actual: TaskKind,
    },
    #[error("{0} already finished and was drained")]
    Settled(TaskHandle),
    #[error("result of {0} was already taken")]
    ResultTaken(TaskHandle),
    #[error("result of {0} has a different type")]
    ResultType(TaskHandle),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[derive(Default)]
struct CellState {
    output: Option<TaskOutput>,
    error: Option<String>,
}

#[derive(Default)]
struct TaskCell {
    state: Mutex<CellState>,
}

impl TaskCell {
    fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().expect("task cell lock poisoned")
    }

    fn store(&self, output: TaskOutput) {
        self.lock().output = Some(output);
    }

    fn fail(&self, message: String) {
        self.lock().error = Some(message);
    }

    fn record_failure(&self, failure: &JobFailure) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(failure.message.clone());
        }
    }

    fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    fn take(&self, handle: TaskHandle) -> Result<TaskOutput, TaskError> {
        self.lock()
            .output
            .take()
            .ok_or(TaskError::ResultTaken(handle))
    }

    fn restore(&self, output: TaskOutput) {
        self.lock().output = Some(output);
    }

    fn peek<R>(&self, read: impl FnOnce(&TaskOutput) -> Option<R>) -> Option<R> {
        self.lock().output.as_ref().and_then(read)
    }
}

pub type TaskCallback = Box<dyn FnOnce(&mut CompletedTask) + Send + 'static>;

struct TaskRecord {
    kind: TaskKind,
    priority: JobPriority,
    job: Option<JobId>,
    settled: Option<JobStatus>,
    failure: Option<JobFailure>,
    cell: Arc<TaskCell>,
    callback: Option<TaskCallback>,
    payload_bytes: usize,
}

pub struct CompletedTask {
    handle: TaskHandle,
    kind: TaskKind,
    status: JobStatus,
    cell: Arc<TaskCell>,
}

impl CompletedTask {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn error_message(&self) -> Option<String> {
        self.cell.error()
    }

    pub fn take_output(&mut self) -> Result<TaskOutput, TaskError> {
        self.cell.take(self.handle)
    }
}

pub struct TaskSystem {
    scheduler: Arc<JobScheduler>,
    owner: OwnerId,
    loaders: Arc<LoaderRegistry>,
    allocator: Arc<dyn CategoryAllocator>,
    table: Mutex<Pool<TaskRecord>>,
}

impl TaskSystem {
    pub fn new(scheduler: Arc<JobScheduler>, loaders: LoaderRegistry) -> Self {
        let allocator = scheduler.allocator();
        let table = Pool::new(MemoryCategory::HandleTable, Arc::clone(&allocator));
        Self {
            scheduler,
            owner: OwnerId::allocate(),
            loaders: Arc::new(loaders),
            allocator,
            table: Mutex::new(table),
        }
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    fn lock_table(&self) -> MutexGuard<'_, Pool<TaskRecord>> {
        self.table.lock().expect("task table lock poisoned")
    }

    pub fn live_tasks(&self) -> usize {
        self.lock_table().len()
    }

    pub fn create_task(
        &self,
        request: TaskRequest,
        priority: JobPriority,
    ) -> Result<TaskHandle, TaskError> {
        let kind = request.kind();
        let payload_bytes = request.payload_bytes();
        self.allocator
            .allocate(MemoryCategory::TaskPayload, payload_bytes)?;

        let cell = Arc::new(TaskCell::default());
        let created = self.lock_table().create(TaskRecord {
            kind,
            priority,
            job: None,
            settled: None,
            failure: None,
            cell: Arc::clone(&cell),
            callback: None,
            payload_bytes,
        });
        let handle = match created {
            Ok(key) => TaskHandle(key),
            Err(err) => {
                self.allocator
                    .free(MemoryCategory::TaskPayload, payload_bytes);
                return Err(err.into());
            }
        };

        let loaders = Arc::clone(&self.loaders);
        let desc = JobDesc::new(move || match loaders.dispatch(request) {
            Ok(output) => {
                cell.store(output);
                Ok(())
            }
            Err(message) => {
                cell.fail(message.clone());
                Err(JobFailure::error(message))
            }
        })
        .priority(priority)
        .context(handle.context());

        match self.scheduler.create_owned_job(self.owner, desc) {
            Ok(job) => {
                if let Some(record) = self.lock_table().get_mut(handle.0) {
                    record.job = Some(job);
                }
                tracing::trace!(task = %handle, %kind, %priority, "task created");
                Ok(handle)
            }
            Err(err) => {
                self.lock_table().destroy(handle.0);
                self.allocator
                    .free(MemoryCategory::TaskPayload, payload_bytes);
                Err(err.into())
            }
        }
    }

    pub fn on_complete<F>(&self, handle: TaskHandle, callback: F) -> Result<(), TaskError>
    where
        F: FnOnce(&mut CompletedTask) + Send + 'static,
    {
        let mut table = self.lock_table();
        let record = table
            .get_mut(handle.0)
            .ok_or(TaskError::StaleHandle(handle))?;
        record.callback = Some(Box::new(callback));
        Ok(())
    }

    pub fn submit_task(&self, handle: TaskHandle) -> Result<(), TaskError> {
        let job = self.job_of(handle)?;
        match job {
            Some(job) => Ok(self.scheduler.submit(job)?),
            None => Err(TaskError::Settled(handle)),
        }
    }

    pub fn spawn_task(
        &self,
        request: TaskRequest,
        priority: JobPriority,
    ) -> Result<TaskHandle, TaskError> {
        let handle = self.create_task(request, priority)?;
        if let Err(err) = self.submit_task(handle) {
            let _ = self.free_task(handle);
            return Err(err);
        }
        Ok(handle)
    }

    pub fn load_texture(
        &self,
        path: impl Into<PathBuf>,
        priority: JobPriority,
    ) -> Result<TaskHandle, TaskError> {
        self.spawn_task(TaskRequest::Texture(path.into()), priority)
    }

    pub fn load_scene(
        &self,
        path: impl Into<PathBuf>,
        priority: JobPriority,
    ) -> Result<TaskHandle, TaskError> {
        self.spawn_task(TaskRequest::Scene(path.into()), priority)
    }

    pub fn load_mesh(&self, mesh: MeshData, priority: JobPriority) -> Result<TaskHandle, TaskError> {
        self.spawn_task(TaskRequest::Mesh(mesh), priority)
    }

    pub fn load_material(
        &self,
        material: MaterialData,
        priority: JobPriority,
    ) -> Result<TaskHandle, TaskError> {
        self.spawn_task(TaskRequest::Material(material), priority)
    }

    pub fn load_blob(
        &self,
        path: impl Into<PathBuf>,
        priority: JobPriority,
    ) -> Result<TaskHandle, TaskError> {
        self.spawn_task(TaskRequest::Blob(path.into()), priority)
    }

    pub fn spawn_custom<T, F>(&self, work: F, priority: JobPriority) -> Result<TaskHandle, TaskError>
    where
        T: Any + Send,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        self.spawn_task(TaskRequest::custom(work), priority)
    }

    pub fn add_dependency(
        &self,
        dependent: TaskHandle,
        dependency: TaskHandle,
    ) -> Result<bool, TaskError> {
        // Held across the scheduler call: a drain settles the slot under this
        // lock, so a live job id here is still known to the scheduler.
        let table = self.lock_table();
        let dependent_job = table
            .get(dependent.0)
            .ok_or(TaskError::StaleHandle(dependent))?
            .job;
        let (dependency_job, dependency_settled) = table
            .get(dependency.0)
            .map(|record| (record.job, record.settled))
            .ok_or(TaskError::StaleHandle(dependency))?;
        let Some(dependent_job) = dependent_job else {
            return Err(TaskError::Settled(dependent));
        };
        match (dependency_job, dependency_settled) {
            (Some(dependency_job), _) => {
                Ok(self.scheduler.add_dependency(dependent_job, dependency_job)?)
            }
            // Already drained: nothing to wait for.
            (None, Some(JobStatus::Completed)) => Ok(false),
            (None, _) => {
                self.scheduler.cancel(dependent_job)?;
                Ok(false)
            }
        }
    }

    pub fn cancel_task(&self, handle: TaskHandle) -> Result<bool, TaskError> {
        match self.job_of(handle)? {
            Some(job) => Ok(self.scheduler.cancel(job)?),
            None => Ok(false),
        }
    }

    fn job_of(&self, handle: TaskHandle) -> Result<Option<JobId>, TaskError> {
        let table = self.lock_table();
        let record = table.get(handle.0).ok_or(TaskError::StaleHandle(handle))?;
        Ok(record.job)
    }

    fn record_status(&self, record: &TaskRecord) -> JobStatus {
        if let Some(status) = record.settled {
            return status;
        }
        record
            .job
            .and_then(|job| self.scheduler.status(job))
            .unwrap_or(JobStatus::Cancelled)
    }

    pub fn status(&self, handle: TaskHandle) -> JobStatus {
        let table = self.lock_table();
        match table.get(handle.0) {
            Some(record) => self.record_status(record),
            None => JobStatus::Failed,
        }
    }

    pub fn kind(&self, handle: TaskHandle) -> Option<TaskKind> {
        self.lock_table().get(handle.0).map(|record| record.kind)
    }

    pub fn priority(&self, handle: TaskHandle) -> Option<JobPriority> {
        self.lock_table().get(handle.0).map(|record| record.priority)
    }

    pub fn is_valid(&self, handle: TaskHandle) -> bool {
        self.lock_table().contains(handle.0)
    }

    pub fn is_loading(&self, handle: TaskHandle) -> bool {
        matches!(self.status(handle), JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_ready(&self, handle: TaskHandle) -> bool {
        self.status(handle) == JobStatus::Completed
    }

    pub fn has_failed(&self, handle: TaskHandle) -> bool {
        matches!(self.status(handle), JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn error_message(&self, handle: TaskHandle) -> Option<String> {
        let table = self.lock_table();
        let Some(record) = table.get(handle.0) else {
            return Some(format!("{} does not refer to a live task", handle));
        };
        if let Some(message) = record.cell.error() {
            return Some(message);
        }
        if let Some(failure) = &record.failure {
            return Some(failure.message.clone());
        }
        let failure = record.job.and_then(|job| self.scheduler.failure(job));
        if let Some(failure) = failure {
            return Some(failure.message);
        }
        match self.record_status(record) {
            JobStatus::Cancelled => Some("cancelled".to_string()),
            _ => None,
        }
    }

    pub fn wait_for_task(&self, handle: TaskHandle, timeout: Option<Duration>) -> bool {
        match self.job_of(handle) {
            Ok(Some(job)) => self.scheduler.wait(job, timeout),
            Ok(None) | Err(_) => true,
        }
    }

    // Drains up to `max` (0 = all) of this system's finished jobs on the
    // calling thread, running each task's callback exactly once. Jobs of
    // freed tasks are released silently. Returns the number of tasks
    // processed.
    pub fn process_completed_tasks(&self, max: usize) -> usize {
        // Slots are settled under the table lock taken before the drain, so no
        // reader sees a job gone from the scheduler but not yet settled.
        let finished = {
            let mut table = self.lock_table();
            let mut finished = Vec::new();
            self.scheduler.drain_owned(self.owner, max, |job| {
                if job.detached {
                    tracing::trace!(job = %job.id, "released orphaned task job");
                    return;
                }
                if let Some(settled) = settle(&mut table, job) {
                    finished.push(settled);
                }
            });
            finished
        };
        let processed = finished.len();
        for (mut completed, callback) in finished {
            if let Some(callback) = callback {
                callback(&mut completed);
            }
        }
        processed
    }

    // Releases the task and recycles its slot. A job still queued or running
    // is orphaned and released by a later drain without a callback.
    pub fn free_task(&self, handle: TaskHandle) -> Result<(), TaskError> {
        let record = {
            let mut table = self.lock_table();
            table
                .destroy(handle.0)
                .ok_or(TaskError::StaleHandle(handle))?
        };
        if let Some(job) = record.job {
            self.scheduler.detach_job(job);
        }
        self.allocator
            .free(MemoryCategory::TaskPayload, record.payload_bytes);
        Ok(())
    }

    fn completed_record(
        &self,
        handle: TaskHandle,
        expected: TaskKind,
    ) -> Result<Arc<TaskCell>, TaskError> {
        let table = self.lock_table();
        let record = table.get(handle.0).ok_or(TaskError::StaleHandle(handle))?;
        let status = self.record_status(record);
        if status != JobStatus::Completed {
            return Err(TaskError::NotCompleted { handle, status });
        }
        if record.kind != expected {
            return Err(TaskError::KindMismatch {
                handle,
                expected,
                actual: record.kind,
            });
        }
        Ok(Arc::clone(&record.cell))
    }

    fn read_result<R>(
        &self,
        handle: TaskHandle,
        expected: TaskKind,
        read: impl FnOnce(&TaskOutput) -> Option<R>,
    ) -> Result<R, TaskError> {
        let cell = self.completed_record(handle, expected)?;
        cell.peek(read).ok_or(TaskError::ResultTaken(handle))
    }

    fn take_boxed(
        &self,
        handle: TaskHandle,
        expected: TaskKind,
    ) -> Result<(Arc<TaskCell>, TaskOutput), TaskError> {
        let cell = self.completed_record(handle, expected)?;
        let output = cell.take(handle)?;
        Ok((cell, output))
    }

    pub fn texture_result(&self, handle: TaskHandle) -> Result<Texture, TaskError> {
        self.read_result(handle, TaskKind::Texture, |output| match output {
            TaskOutput::Texture(texture) => Some(texture.clone()),
            _ => None,
        })
    }

    pub fn mesh_result(&self, handle: TaskHandle) -> Result<MeshData, TaskError> {
        self.read_result(handle, TaskKind::Mesh, |output| match output {
            TaskOutput::Mesh(mesh) => Some(mesh.clone()),
            _ => None,
        })
    }

    pub fn material_result(&self, handle: TaskHandle) -> Result<MaterialData, TaskError> {
        self.read_result(handle, TaskKind::Material, |output| match output {
            TaskOutput::Material(material) => Some(material.clone()),
            _ => None,
        })
    }

    pub fn take_blob_result(&self, handle: TaskHandle) -> Result<Vec<u8>, TaskError> {
        match self.take_boxed(handle, TaskKind::Blob)? {
            (_, TaskOutput::Blob(bytes)) => Ok(bytes),
            (cell, other) => {
                cell.restore(other);
                Err(TaskError::ResultType(handle))
            }
        }
    }

    pub fn take_scene_result<T: Any>(&self, handle: TaskHandle) -> Result<T, TaskError> {
        match self.take_boxed(handle, TaskKind::Scene)? {
            (cell, TaskOutput::Scene(scene)) => match scene.downcast::<T>() {
                Ok(scene) => Ok(*scene),
                Err(scene) => {
                    cell.restore(TaskOutput::Scene(scene));
                    Err(TaskError::ResultType(handle))
                }
            },
            (cell, other) => {
                cell.restore(other);
                Err(TaskError::ResultType(handle))
            }
        }
    }

    pub fn take_custom_result<T: Any>(&self, handle: TaskHandle) -> Result<T, TaskError> {
        match self.take_boxed(handle, TaskKind::Custom)? {
            (cell, TaskOutput::Custom(value)) => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => {
                    cell.restore(TaskOutput::Custom(value));
                    Err(TaskError::ResultType(handle))
                }
            },
            (cell, other) => {
                cell.restore(other);
                Err(TaskError::ResultType(handle))
            }
        }
    }
}

fn settle(
    table: &mut Pool<TaskRecord>,
    job: CompletedJob,
) -> Option<(CompletedTask, Option<TaskCallback>)> {
    let handle = TaskHandle::from_context(job.context?);
    let Some(record) = table.get_mut(handle.0) else {
        tracing::debug!(task = %handle, job = %job.id, "completed job for freed task");
        return None;
    };
    record.job = None;
    record.settled = Some(job.status);
    if let Some(failure) = job.failure {
        record.cell.record_failure(&failure);
        record.failure = Some(failure);
    }
    let completed = CompletedTask {
        handle,
        kind: record.kind,
        status: job.status,
        cell: Arc::clone(&record.cell),
    };
    Some((completed, record.callback.take()))
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        let records = match self.table.get_mut() {
            Ok(table) => table.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        };
        for record in records {
            if let Some(job) = record.job {
                self.scheduler.detach_job(job);
            }
            self.allocator
                .free(MemoryCategory::TaskPayload, record.payload_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loaders::write_test_png;
    use super::*;
    use crate::alloc::CountingAllocator;
    use crate::config::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn system(workers: usize) -> TaskSystem {
        let scheduler =
            JobScheduler::new(SchedulerConfig::with_workers(workers)).expect("scheduler");
        TaskSystem::new(Arc::new(scheduler), LoaderRegistry::with_defaults())
    }

    fn drain_until(tasks: &TaskSystem, expected: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut processed = 0;
        while processed < expected && Instant::now() < deadline {
            processed += tasks.process_completed_tasks(0);
            if processed < expected {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        processed
    }

    #[test]
    fn mixed_priority_custom_tasks_complete_with_one_callback_each() {
        let tasks = system(2);
        let fired = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for priority in [JobPriority::Low, JobPriority::High, JobPriority::Critical] {
            let handle = tasks
                .create_task(TaskRequest::custom(move || Ok(priority.as_str())), priority)
                .expect("create");
            let fired = Arc::clone(&fired);
            tasks
                .on_complete(handle, move |done| {
                    assert!(done.succeeded());
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .expect("callback");
            tasks.submit_task(handle).expect("submit");
            handles.push(handle);
        }
        for handle in &handles {
            assert!(tasks.wait_for_task(*handle, WAIT));
        }
        assert_eq!(tasks.process_completed_tasks(0), 3);
        assert_eq!(tasks.process_completed_tasks(0), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        for handle in &handles {
            assert!(tasks.is_ready(*handle));
            assert!(!tasks.is_loading(*handle));
        }
        assert_eq!(
            tasks.take_custom_result::<&'static str>(handles[2]).expect("result"),
            "critical"
        );
    }

    #[test]
    fn waited_tasks_drain_in_a_single_pass() {
        let tasks = system(3);
        for _ in 0..200 {
            let handles: Vec<TaskHandle> =
                [JobPriority::Low, JobPriority::High, JobPriority::Critical]
                    .into_iter()
                    .map(|priority| tasks.spawn_custom(|| Ok(()), priority).expect("spawn"))
                    .collect();
            for handle in &handles {
                assert!(tasks.wait_for_task(*handle, None));
            }
            assert_eq!(tasks.process_completed_tasks(0), 3);
            for handle in handles {
                tasks.free_task(handle).expect("free");
            }
        }
    }

    #[test]
    fn undrained_results_do_not_stall_later_tasks() {
        let config = SchedulerConfig {
            completed_capacity: 1,
            ..SchedulerConfig::with_workers(1)
        };
        let scheduler = JobScheduler::new(config).expect("scheduler");
        let tasks = TaskSystem::new(Arc::new(scheduler), LoaderRegistry::empty());
        let handles: Vec<TaskHandle> = (0..3u32)
            .map(|value| {
                tasks
                    .spawn_custom(move || Ok(value), JobPriority::Normal)
                    .expect("spawn")
            })
            .collect();
        assert!(tasks.wait_for_task(handles[2], Some(Duration::from_secs(2))));
        assert!(tasks.is_ready(handles[2]));
        assert_eq!(tasks.process_completed_tasks(0), 3);
        for (value, handle) in handles.into_iter().enumerate() {
            assert_eq!(
                tasks.take_custom_result::<u32>(handle).expect("result"),
                value as u32
            );
        }
    }

    #[test]
    fn dependency_drained_concurrently_still_links_cleanly() {
        let tasks = system(2);
        let stop = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    tasks.process_completed_tasks(0);
                    std::thread::yield_now();
                }
            });
            for _ in 0..200 {
                let dependency = tasks
                    .spawn_custom(|| Ok(()), JobPriority::Normal)
                    .expect("dependency");
                assert!(tasks.wait_for_task(dependency, WAIT));
                let dependent = tasks
                    .create_task(TaskRequest::custom(|| Ok(())), JobPriority::Normal)
                    .expect("dependent");
                assert!(!tasks
                    .add_dependency(dependent, dependency)
                    .expect("settled dependency"));
                assert_ne!(tasks.status(dependent), JobStatus::Cancelled);
                tasks.free_task(dependent).expect("free dependent");
                tasks.free_task(dependency).expect("free dependency");
            }
            stop.store(true, Ordering::Release);
        });
    }

    #[test]
    fn callbacks_run_only_on_the_draining_thread() {
        let tasks = system(2);
        let (tx, rx) = mpsc::channel();
        let handle = tasks
            .create_task(TaskRequest::custom(|| Ok(1u8)), JobPriority::Normal)
            .expect("create");
        tasks
            .on_complete(handle, move |_| {
                let _ = tx.send(std::thread::current().id());
            })
            .expect("callback");
        tasks.submit_task(handle).expect("submit");
        assert!(tasks.wait_for_task(handle, WAIT));
        assert!(rx.try_recv().is_err());
        drain_until(&tasks, 1);
        assert_eq!(rx.try_recv().expect("fired"), std::thread::current().id());
    }

    #[test]
    fn stale_handle_after_slot_reuse() {
        let tasks = system(1);
        let first = tasks
            .create_task(TaskRequest::custom(|| Ok(())), JobPriority::Normal)
            .expect("create");
        tasks.free_task(first).expect("free");
        let second = tasks
            .create_task(TaskRequest::custom(|| Ok(())), JobPriority::Normal)
            .expect("create");
        assert_eq!(second.key().index(), first.key().index());
        assert_ne!(second, first);

        assert!(!tasks.is_valid(first));
        assert!(!tasks.is_loading(first));
        assert!(!tasks.is_ready(first));
        assert!(tasks.has_failed(first));
        assert!(tasks.wait_for_task(first, None));
        assert!(matches!(
            tasks.free_task(first),
            Err(TaskError::StaleHandle(_))
        ));
        assert!(tasks.is_loading(second));
    }

    #[test]
    fn bounded_wait_times_out_while_loading() {
        let tasks = system(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = tasks
            .spawn_custom(
                move || {
                    let _ = release_rx.recv();
                    Ok(())
                },
                JobPriority::Normal,
            )
            .expect("spawn");
        assert!(!tasks.wait_for_task(handle, Some(Duration::from_millis(30))));
        assert!(tasks.is_loading(handle));
        release_tx.send(()).expect("release");
        assert!(tasks.wait_for_task(handle, None));
        assert!(tasks.is_ready(handle));
    }

    #[test]
    fn failed_loader_reports_message() {
        let tasks = system(1);
        let handle = tasks
            .load_blob("/definitely/not/here.bin", JobPriority::Normal)
            .expect("spawn");
        assert!(tasks.wait_for_task(handle, WAIT));
        assert!(tasks.has_failed(handle));
        assert!(tasks
            .error_message(handle)
            .expect("message")
            .contains("here.bin"));
        drain_until(&tasks, 1);
        assert!(tasks.has_failed(handle));
        assert!(matches!(
            tasks.take_blob_result(handle),
            Err(TaskError::NotCompleted { .. })
        ));
    }

    #[test]
    fn panicking_custom_task_fails() {
        let tasks = system(1);
        let handle = tasks
            .spawn_custom::<(), _>(|| panic!("loader exploded"), JobPriority::High)
            .expect("spawn");
        assert!(tasks.wait_for_task(handle, WAIT));
        drain_until(&tasks, 1);
        assert_eq!(tasks.status(handle), JobStatus::Failed);
        assert!(tasks
            .error_message(handle)
            .expect("message")
            .contains("loader exploded"));
    }

    #[test]
    fn loads_texture_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("pixel.png");
        write_test_png(&path, 1, 1, png::ColorType::Rgba, &[1, 2, 3, 4]);

        let tasks = system(2);
        let handle = tasks
            .load_texture(&path, JobPriority::Normal)
            .expect("spawn");
        assert!(tasks.wait_for_task(handle, WAIT));
        let texture = tasks.texture_result(handle).expect("texture");
        assert_eq!((texture.width, texture.height), (1, 1));
        assert_eq!(*texture.rgba, vec![1, 2, 3, 4]);
        assert!(matches!(
            tasks.mesh_result(handle),
            Err(TaskError::KindMismatch { .. })
        ));
    }

    #[test]
    fn move_results_can_be_taken_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").expect("write");

        let tasks = system(1);
        let handle = tasks.load_blob(&path, JobPriority::Low).expect("spawn");
        assert!(tasks.wait_for_task(handle, WAIT));
        assert_eq!(tasks.take_blob_result(handle).expect("blob"), b"payload");
        assert!(matches!(
            tasks.take_blob_result(handle),
            Err(TaskError::ResultTaken(_))
        ));
        tasks.free_task(handle).expect("free");
    }

    #[test]
    fn wrong_custom_type_leaves_result_in_place() {
        let tasks = system(1);
        let handle = tasks
            .spawn_custom(|| Ok(42u64), JobPriority::Normal)
            .expect("spawn");
        assert!(tasks.wait_for_task(handle, WAIT));
        assert!(matches!(
            tasks.take_custom_result::<String>(handle),
            Err(TaskError::ResultType(_))
        ));
        assert_eq!(tasks.take_custom_result::<u64>(handle).expect("value"), 42);
    }

    #[test]
    fn callback_can_take_result() {
        let tasks = system(1);
        let mesh = MeshData {
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..MeshData::default()
        };
        let handle = tasks
            .create_task(TaskRequest::Mesh(mesh), JobPriority::Normal)
            .expect("create");
        let (tx, rx) = mpsc::channel();
        tasks
            .on_complete(handle, move |done| {
                let _ = tx.send(done.take_output().map(|output| output.kind()).ok());
            })
            .expect("callback");
        tasks.submit_task(handle).expect("submit");
        assert!(tasks.wait_for_task(handle, WAIT));
        drain_until(&tasks, 1);
        assert_eq!(rx.try_recv().expect("fired"), Some(TaskKind::Mesh));
        assert!(matches!(
            tasks.mesh_result(handle),
            Err(TaskError::ResultTaken(_))
        ));
    }

    #[test]
    fn task_dependencies_order_execution() {
        let tasks = system(3);
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let order = Arc::clone(&order);
            TaskRequest::custom(move || {
                std::thread::sleep(Duration::from_millis(if label == "a" { 20 } else { 0 }));
                order.lock().expect("order lock").push(label);
                Ok(())
            })
        };
        let a = tasks.create_task(record("a"), JobPriority::Low).expect("a");
        let b = tasks
            .create_task(record("b"), JobPriority::Critical)
            .expect("b");
        assert!(tasks.add_dependency(b, a).expect("link"));
        tasks.submit_task(b).expect("submit b");
        tasks.submit_task(a).expect("submit a");
        assert!(tasks.wait_for_task(b, WAIT));
        assert_eq!(*order.lock().expect("order lock"), vec!["a", "b"]);
    }

    #[test]
    fn freeing_in_flight_task_orphans_its_job() {
        let tasks = system(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = tasks
            .create_task(
                TaskRequest::custom(move || {
                    let _ = release_rx.recv();
                    Ok(())
                }),
                JobPriority::Normal,
            )
            .expect("create");
        let fired_clone = Arc::clone(&fired);
        tasks
            .on_complete(handle, move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .expect("callback");
        tasks.submit_task(handle).expect("submit");
        tasks.free_task(handle).expect("free");
        // Fails harmlessly if the job was cancelled before it started.
        let _ = release_tx.send(());

        let deadline = Instant::now() + Duration::from_secs(5);
        while tasks.scheduler().telemetry().live_jobs > 0 && Instant::now() < deadline {
            tasks.process_completed_tasks(0);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(tasks.scheduler().telemetry().live_jobs, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tasks.live_tasks(), 0);
    }

    #[test]
    fn systems_sharing_a_scheduler_drain_only_their_own() {
        let scheduler =
            Arc::new(JobScheduler::new(SchedulerConfig::with_workers(2)).expect("scheduler"));
        let first = TaskSystem::new(Arc::clone(&scheduler), LoaderRegistry::empty());
        let second = TaskSystem::new(Arc::clone(&scheduler), LoaderRegistry::empty());
        let a = first
            .spawn_custom(|| Ok(1u8), JobPriority::Normal)
            .expect("a");
        let b = second
            .spawn_custom(|| Ok(2u8), JobPriority::Normal)
            .expect("b");
        assert!(first.wait_for_task(a, WAIT));
        assert!(second.wait_for_task(b, WAIT));
        assert_eq!(drain_until(&first, 1), 1);
        assert_eq!(first.process_completed_tasks(0), 0);
        assert_eq!(drain_until(&second, 1), 1);
    }

    #[test]
    fn payload_accounting_is_released_on_free() {
        let allocator = Arc::new(CountingAllocator::new());
        let scheduler = JobScheduler::with_allocator(
            SchedulerConfig::with_workers(1),
            allocator.clone(),
        )
        .expect("scheduler");
        let tasks = TaskSystem::new(Arc::new(scheduler), LoaderRegistry::with_defaults());
        let mesh = MeshData {
            positions: vec![[0.0; 3]; 3],
            indices: vec![0, 1, 2],
            ..MeshData::default()
        };
        let bytes = mesh.byte_len();
        let handle = tasks
            .create_task(TaskRequest::Mesh(mesh), JobPriority::Normal)
            .expect("create");
        assert_eq!(allocator.stats().task_payload.live_bytes, bytes);
        assert!(allocator.stats().handle_table.live_bytes > 0);
        tasks.free_task(handle).expect("free");
        assert_eq!(allocator.stats().task_payload.live_bytes, 0);
    }

    #[test]
    fn refused_handle_slot_fails_creation() {
        let allocator = Arc::new(CountingAllocator::with_limit(0));
        let config = SchedulerConfig {
            prewarm_jobs: 0,
            prewarm_links: 0,
            ..SchedulerConfig::with_workers(1)
        };
        let scheduler =
            Arc::new(JobScheduler::with_allocator(config, allocator.clone()).expect("scheduler"));
        let tasks = TaskSystem::new(scheduler, LoaderRegistry::empty());
        let err = tasks
            .create_task(TaskRequest::custom(|| Ok(())), JobPriority::Normal)
            .expect_err("no room for a slot");
        assert!(matches!(err, TaskError::Alloc(_)));
        assert_eq!(tasks.live_tasks(), 0);
        assert_eq!(tasks.scheduler().telemetry().live_jobs, 0);
    }

    #[test]
    fn failed_job_creation_releases_the_slot() {
        let allocator = Arc::new(CountingAllocator::new());
        let config = SchedulerConfig {
            prewarm_jobs: 0,
            prewarm_links: 0,
            ..SchedulerConfig::with_workers(1)
        };
        let scheduler =
            Arc::new(JobScheduler::with_allocator(config, allocator.clone()).expect("scheduler"));
        scheduler.shutdown();
        let tasks = TaskSystem::new(scheduler, LoaderRegistry::empty());
        let err = tasks
            .create_task(TaskRequest::custom(|| Ok(())), JobPriority::Normal)
            .expect_err("scheduler closed");
        assert!(matches!(err, TaskError::Job(JobError::ShuttingDown)));
        assert_eq!(tasks.live_tasks(), 0);
        assert_eq!(allocator.stats().task_payload.live_bytes, 0);
    }
}
