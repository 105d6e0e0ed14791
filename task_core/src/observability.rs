use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::job::JobStatus;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub pending_depth: usize,
    pub waiting_depth: usize,
    pub completed_depth: usize,
    pub deferred: usize,
    pub completed_overflow: usize,
    pub workers: usize,
    pub workers_active: usize,
    pub live_jobs: usize,
    pub live_links: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    pub fn set_active(&self, active: bool) {
        if active {
            self.active.fetch_add(1, Ordering::Relaxed);
        } else {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn record_terminal(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.completed,
            JobStatus::Failed => &self.failed,
            JobStatus::Cancelled => &self.cancelled,
            JobStatus::Pending | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fill(&self, telemetry: &mut SchedulerTelemetry) {
        telemetry.workers_active = self.active.load(Ordering::Relaxed);
        telemetry.jobs_completed = self.completed.load(Ordering::Relaxed);
        telemetry.jobs_failed = self.failed.load(Ordering::Relaxed);
        telemetry.jobs_cancelled = self.cancelled.load(Ordering::Relaxed);
    }
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
