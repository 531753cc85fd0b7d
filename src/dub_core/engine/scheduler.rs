use std::time::Instant;

use serde::Serialize;

use crate::dub_core::domain::{clamp_priority, JobState, QueuedJob};
use crate::sync_ext::MutexExt;

use super::state::{class_limit, effective_priority, resolve_device, resource_class, Inner, QueuedEntry, SchedState};

/// Head-ordered view of the queue for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshotEntry {
    pub job_id: String,
    pub owner_id: String,
    pub priority: u32,
    pub effective_priority: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Scheduler counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerState {
    pub queued: usize,
    pub running_global: usize,
    pub max_global: usize,
    pub running_by_user: std::collections::HashMap<String, usize>,
    pub running_by_class: std::collections::HashMap<String, usize>,
}

pub(crate) fn submit(inner: &Inner, job: QueuedJob) {
    let mut state = inner.state.lock_unpoisoned();
    let job_id = job.job_id.clone();
    // Re-submission of a queued job replaces its entry instead of duplicating.
    state.queue.retain(|entry| entry.job.job_id != job_id);
    state.queue.push(QueuedEntry {
        job,
        not_before: None,
    });
    inner.metrics.jobs_queued_total.inc();
    inner.cv.notify_all();
}

pub(crate) fn reprioritize(inner: &Inner, job_id: &str, priority: u32) -> bool {
    let mut state = inner.state.lock_unpoisoned();
    match state
        .queue
        .iter_mut()
        .find(|entry| entry.job.job_id == job_id)
    {
        Some(entry) => {
            entry.job.priority = clamp_priority(priority);
            inner.cv.notify_all();
            true
        }
        None => false,
    }
}

pub(crate) fn drop_job(inner: &Inner, job_id: &str) -> usize {
    let mut state = inner.state.lock_unpoisoned();
    let before = state.queue.len();
    state.queue.retain(|entry| entry.job.job_id != job_id);
    before - state.queue.len()
}

pub(crate) fn snapshot_queue(inner: &Inner, limit: usize) -> Vec<QueueSnapshotEntry> {
    let state = inner.state.lock_unpoisoned();
    let mut entries: Vec<QueueSnapshotEntry> = state
        .queue
        .iter()
        .map(|entry| QueueSnapshotEntry {
            job_id: entry.job.job_id.clone(),
            owner_id: entry.job.owner_id.clone(),
            priority: entry.job.priority,
            effective_priority: effective_priority(&inner.settings, &entry.job),
            created_at: entry.job.created_at,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.effective_priority
            .cmp(&a.effective_priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    entries.truncate(limit.max(1));
    entries
}

pub(crate) fn scheduler_state(inner: &Inner) -> SchedulerState {
    let state = inner.state.lock_unpoisoned();
    SchedulerState {
        queued: state.queue.len(),
        running_global: state.running_global,
        max_global: inner.settings.concurrency.max_global,
        running_by_user: state.running_by_user.clone(),
        running_by_class: state
            .running_by_class
            .iter()
            .map(|(class, count)| (format!("{class:?}").to_ascii_lowercase(), *count))
            .collect(),
    }
}

/// Pick and admit the best eligible job under the lock, incrementing every
/// counter it is admitted against. Admission order: highest effective
/// priority first, FIFO within a tie.
pub(crate) fn select_admissible_locked(inner: &Inner, state: &mut SchedState) -> Option<AdmittedJob> {
    let settings = &inner.settings;
    if state.running_global >= settings.concurrency.max_global {
        return None;
    }

    let now = Instant::now();
    let mut order: Vec<usize> = (0..state.queue.len()).collect();
    order.sort_by(|&a, &b| {
        let ea = effective_priority(settings, &state.queue[a].job);
        let eb = effective_priority(settings, &state.queue[b].job);
        eb.cmp(&ea)
            .then(state.queue[a].job.created_at.cmp(&state.queue[b].job.created_at))
    });

    for index in order {
        let entry = &state.queue[index];
        if entry.not_before.is_some_and(|t| now < t) {
            continue;
        }
        let job = &entry.job;

        let user_running = state
            .running_by_user
            .get(&job.owner_id)
            .copied()
            .unwrap_or(0);
        if user_running >= settings.concurrency.max_per_user {
            continue;
        }

        let resolved = resolve_device(settings, job.device);
        let class = resource_class(job.mode, resolved);
        let class_running = state.running_by_class.get(&class).copied().unwrap_or(0);
        if class_running >= class_limit(settings, class) {
            continue;
        }

        // Quota + disk guard; refusals leave the job queued for a later tick.
        if inner.quotas.check_admission(&job.owner_id).is_err() {
            continue;
        }

        let entry = state.queue.remove(index);
        let job = entry.job;
        state.running_global += 1;
        *state.running_by_user.entry(job.owner_id.clone()).or_insert(0) += 1;
        *state.running_by_class.entry(class).or_insert(0) += 1;
        state.running_jobs.insert(job.job_id.clone());
        return Some(AdmittedJob {
            job,
            class,
            resolved_device: resolved,
        });
    }
    None
}

#[derive(Debug, Clone)]
pub(crate) struct AdmittedJob {
    pub job: QueuedJob,
    pub class: crate::dub_core::domain::ResourceClass,
    pub resolved_device: crate::dub_core::domain::DevicePref,
}

/// Completion signal: decrement every counter the admission incremented and
/// wake the dispatch loop.
pub(crate) fn on_job_done(inner: &Inner, admitted: &AdmittedJob) {
    let mut state = inner.state.lock_unpoisoned();
    state.running_global = state.running_global.saturating_sub(1);
    if let Some(count) = state.running_by_user.get_mut(&admitted.job.owner_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.running_by_user.remove(&admitted.job.owner_id);
        }
    }
    if let Some(count) = state.running_by_class.get_mut(&admitted.class) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.running_by_class.remove(&admitted.class);
        }
    }
    state.running_jobs.remove(&admitted.job.job_id);
    state.cancel_requests.remove(&admitted.job.job_id);
    drop(state);
    inner.cv.notify_all();
}

/// Requeue after a distributed-gate refusal: the job goes back with a short
/// back-off so this instance retries later instead of spinning.
pub(crate) fn requeue_delayed(inner: &Inner, admitted: AdmittedJob, delay: std::time::Duration) {
    on_job_done(inner, &admitted);
    let mut state = inner.state.lock_unpoisoned();
    state.queue.push(QueuedEntry {
        job: admitted.job,
        not_before: Some(Instant::now() + delay),
    });
}

/// Cancel bookkeeping shared by the API and admin paths. Returns true when
/// anything observable changed (idempotent second calls return false).
pub(crate) fn request_cancel(inner: &Inner, job_id: &str) -> bool {
    let queued_removed = drop_job(inner, job_id) > 0;
    let was_running = {
        let mut state = inner.state.lock_unpoisoned();
        if state.running_jobs.contains(job_id) {
            state.cancel_requests.insert(job_id.to_string())
        } else {
            false
        }
    };

    let state_changed = match inner.store.get_job(job_id) {
        Ok(Some(job)) if !job.state.is_terminal() => inner
            .store
            .update_job(job_id, |job| {
                job.state = JobState::Canceled;
                job.message = "Canceled".to_string();
            })
            .is_ok(),
        _ => false,
    };

    if let Some(adapter) = &inner.adapter {
        if adapter.is_active() {
            adapter.cancel_job(job_id);
        }
    }
    inner.cv.notify_all();
    queued_removed || was_running || state_changed
}
