//! Dependency links between jobs.
//!
//! Each job keeps an intrusive list of links, one per job waiting on it, and
//! a counter of dependencies it is still waiting for. Everything here runs
//! with the coordination lock held, so linking, resolving and promotion are
//! serialized against submission and settlement.

use std::collections::HashSet;

use crate::job::{DependencyLink, JobFailure, JobId, JobLocation, JobStatus, QueuedJob};
use crate::pool::PoolKey;
use crate::queue::QueueError;
use crate::scheduler::{JobError, SchedulerShared, SchedulerState};

impl SchedulerShared {
    pub(crate) fn link_dependency(
        &self,
        state: &mut SchedulerState,
        dependent: JobId,
        dependency: JobId,
    ) -> Result<bool, JobError> {
        if dependent == dependency {
            return Err(JobError::SelfDependency(dependent));
        }
        let dependent_record = state
            .jobs
            .get(dependent.0)
            .ok_or(JobError::UnknownJob(dependent))?;
        match dependent_record.location {
            JobLocation::Unsubmitted | JobLocation::Waiting => {}
            _ => return Err(JobError::DependentAlreadyScheduled(dependent)),
        }
        let dependency_record = state
            .jobs
            .get(dependency.0)
            .ok_or(JobError::UnknownJob(dependency))?;

        // Already settled: its dependents list is gone, decide right here.
        if dependency_record.location == JobLocation::Completed {
            if dependency_record.status != JobStatus::Completed {
                self.mark_cancelled(state, dependent, Some(dependency_failure()));
            }
            return Ok(false);
        }

        if reaches(state, dependent, dependency) {
            return Err(JobError::DependencyCycle {
                dependent,
                dependency,
            });
        }

        let next = dependency_record.dependents;
        let link = state.links.create(DependencyLink { dependent, next })?;
        if let Some(record) = state.jobs.get_mut(dependency.0) {
            record.dependents = Some(link);
        }
        if let Some(record) = state.jobs.get_mut(dependent.0) {
            record.unresolved += 1;
        }
        tracing::trace!(%dependent, %dependency, "dependency linked");
        Ok(true)
    }

    pub(crate) fn resolve_dependents(
        &self,
        state: &mut SchedulerState,
        head: Option<PoolKey>,
        satisfied: bool,
    ) {
        let mut cursor = head;
        while let Some(key) = cursor {
            let Some(link) = state.links.destroy(key) else {
                break;
            };
            cursor = link.next;
            if !satisfied {
                self.mark_cancelled(state, link.dependent, Some(dependency_failure()));
            }
            let Some(record) = state.jobs.get_mut(link.dependent.0) else {
                continue;
            };
            record.unresolved = record.unresolved.saturating_sub(1);
            if record.unresolved == 0 && record.location == JobLocation::Waiting {
                let entry = record.entry(link.dependent);
                self.promote(state, entry);
            }
        }
    }

    pub(crate) fn mark_cancelled(
        &self,
        state: &mut SchedulerState,
        id: JobId,
        failure: Option<JobFailure>,
    ) -> bool {
        let Some(record) = state.jobs.get_mut(id.0) else {
            return false;
        };
        if record.status != JobStatus::Pending {
            return false;
        }
        record.status = JobStatus::Cancelled;
        if failure.is_some() {
            record.failure = failure;
        }
        if record.location == JobLocation::Waiting {
            let entry = record.entry(id);
            self.promote(state, entry);
        }
        self.terminal.notify_all();
        true
    }

    pub(crate) fn promote(&self, state: &mut SchedulerState, entry: QueuedJob) {
        self.waiting.remove(&entry);
        match self.pending.push(entry, entry.priority) {
            Ok(()) => {}
            Err(QueueError::Full(_)) => {
                tracing::debug!(job = %entry.id, "pending queue full, deferring promotion");
                state.deferred.push_back(entry);
            }
            Err(QueueError::Closed(_)) => return,
        }
        if let Some(record) = state.jobs.get_mut(entry.id.0) {
            record.location = JobLocation::Pending;
        }
    }

    pub(crate) fn flush_deferred(&self) {
        let mut state = self.lock_state();
        while let Some(entry) = state.deferred.front().copied() {
            if self.pending.push(entry, entry.priority).is_err() {
                break;
            }
            state.deferred.pop_front();
        }
    }

    pub(crate) fn release_unsubmitted(&self, state: &mut SchedulerState, id: JobId) {
        let Some(record) = state.jobs.destroy(id.0) else {
            return;
        };
        self.resolve_dependents(state, record.dependents, false);
        self.terminal.notify_all();
    }
}

fn dependency_failure() -> JobFailure {
    JobFailure::new(JobFailure::CODE_DEPENDENCY, "a dependency did not complete")
}

// True if `target` already waits, directly or transitively, on `from`.
fn reaches(state: &SchedulerState, from: JobId, target: JobId) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(record) = state.jobs.get(id.0) else {
            continue;
        };
        let mut cursor = record.dependents;
        while let Some(key) = cursor {
            let Some(link) = state.links.get(key) else {
                break;
            };
            if link.dependent == target {
                return true;
            }
            stack.push(link.dependent);
            cursor = link.next;
        }
    }
    false
}
