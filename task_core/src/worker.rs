use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::job::{ErrorHandler, JobFailure, JobFn, JobId, JobLocation, JobStatus};
use crate::observability::panic_payload_to_string;
use crate::scheduler::SchedulerShared;

pub(crate) fn spawn_worker(
    shared: &Arc<SchedulerShared>,
    index: usize,
) -> std::io::Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("jobs-worker-{}", index))
        .spawn(move || worker_loop(&shared))
}

enum Claim {
    Run {
        work: JobFn,
        on_error: Option<ErrorHandler>,
    },
    Skip,
}

fn worker_loop(shared: &SchedulerShared) {
    tracing::debug!("worker started");
    loop {
        shared.flush_deferred();
        let Some(entry) = shared.pending.pop(true) else {
            break;
        };
        let Some(claim) = claim(shared, entry.id) else {
            continue;
        };
        let (status, failure) = match claim {
            Claim::Skip => (JobStatus::Cancelled, None),
            Claim::Run { work, on_error } => {
                shared.counters.set_active(true);
                let outcome = run(work, on_error);
                shared.counters.set_active(false);
                match outcome {
                    Ok(()) => (JobStatus::Completed, None),
                    Err(failure) => (JobStatus::Failed, Some(failure)),
                }
            }
        };
        finish(shared, entry.id, status, failure);
    }
    tracing::debug!("worker stopped");
}

// Cancelled jobs are skipped and settle without running.
fn claim(shared: &SchedulerShared, id: JobId) -> Option<Claim> {
    let mut state = shared.lock_state();
    let record = state.jobs.get_mut(id.0)?;
    if record.status == JobStatus::Cancelled {
        return Some(Claim::Skip);
    }
    let Some(work) = record.work.take() else {
        return Some(Claim::Skip);
    };
    record.status = JobStatus::Running;
    record.location = JobLocation::Running;
    Some(Claim::Run {
        work,
        on_error: record.on_error.take(),
    })
}

fn run(work: JobFn, on_error: Option<ErrorHandler>) -> Result<(), JobFailure> {
    let failure = match panic::catch_unwind(panic::AssertUnwindSafe(work)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(failure)) => failure,
        Err(payload) => JobFailure::new(
            JobFailure::CODE_PANIC,
            panic_payload_to_string(payload.as_ref()),
        ),
    };
    tracing::warn!(code = failure.code, message = %failure.message, "job failed");
    if let Some(handler) = on_error {
        if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(|| handler(&failure))) {
            tracing::error!(
                panic = %panic_payload_to_string(payload.as_ref()),
                "job error handler panicked"
            );
        }
    }
    Err(failure)
}

// Status, dependents and the completed entry are all published under one
// lock hold, so a job seen as terminal is already drainable.
fn finish(shared: &SchedulerShared, id: JobId, status: JobStatus, failure: Option<JobFailure>) {
    let mut state = shared.lock_state();
    let Some(record) = state.jobs.get_mut(id.0) else {
        return;
    };
    record.status = status;
    record.location = JobLocation::Completed;
    if failure.is_some() {
        record.failure = failure;
    }
    record.work = None;
    record.on_error = None;
    let head = record.dependents.take();
    let entry = record.entry(id);
    shared.resolve_dependents(&mut state, head, status == JobStatus::Completed);
    shared.publish_completed(&mut state, entry);
    drop(state);
    shared.counters.record_terminal(status);
    shared.terminal.notify_all();
    tracing::trace!(job = %id, %status, "job settled");
}
