use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::dub_core::domain::JobState;
use crate::sync_ext::{CondvarExt, MutexExt};

use super::runner;
use super::scheduler::{on_job_done, requeue_delayed, select_admissible_locked, AdmittedJob};
use super::state::Inner;

/// How long a job waits before this instance retries a distributed-gate
/// refusal (another instance holds the lock or the user is at their cap).
const DISTRIBUTED_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Park interval for idle workers; bounded so `not_before` back-offs and
/// aging re-evaluate without an explicit wake.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Spawn worker threads up to the configured global concurrency. Each worker
/// owns one running job at a time; within a job, stages are strictly
/// sequential.
pub(crate) fn spawn_workers(inner: &Arc<Inner>) {
    let desired = inner.settings.concurrency.max_global.max(1);
    let start_index = {
        let state = inner.state.lock_unpoisoned();
        state.spawned_workers
    };

    let mut spawned = 0usize;
    for index in start_index..desired {
        let inner_clone = inner.clone();
        let result = std::thread::Builder::new()
            .name(format!("dubforge-worker-{index}"))
            .spawn(move || worker_loop(&inner_clone))
            .map(|_| ());
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to spawn worker thread");
            break;
        }
        spawned += 1;
    }

    if spawned > 0 {
        let mut state = inner.state.lock_unpoisoned();
        state.spawned_workers = state.spawned_workers.max(start_index + spawned);
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    loop {
        let admitted = {
            let mut state = inner.state.lock_unpoisoned();
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(admitted) = select_admissible_locked(inner, &mut state) {
                    break admitted;
                }
                let (guard, _timeout) = inner.cv.wait_timeout_unpoisoned(state, IDLE_WAIT);
                state = guard;
            }
        };

        // Cluster-wide gate: lock + per-user cap. A refusal is not an error,
        // the job just waits for a later attempt.
        if let Some(adapter) = &inner.adapter {
            if adapter.is_active()
                && !adapter.before_job_run(&admitted.job.job_id, &admitted.job.owner_id)
            {
                tracing::debug!(job_id = %admitted.job.job_id, "distributed gate refused; requeueing");
                requeue_delayed(inner, admitted, DISTRIBUTED_RETRY_DELAY);
                continue;
            }
        }

        let job_id = admitted.job.job_id.clone();
        let result = catch_unwind(AssertUnwindSafe(|| runner::run_job(inner, &admitted)));

        let (final_state, ok) = match &result {
            Ok(Ok(state)) => (*state, true),
            Ok(Err(err)) => {
                mark_failed(inner, &job_id, &format!("{err:#}"));
                (JobState::Failed, false)
            }
            Err(payload) => {
                let reason = panic_payload_to_string(payload.as_ref());
                mark_failed(inner, &job_id, &format!("worker panicked: {reason}"));
                (JobState::Failed, false)
            }
        };

        if let Some(adapter) = &inner.adapter {
            adapter.after_job_run(
                &job_id,
                &admitted.job.owner_id,
                final_state.as_str(),
                ok,
            );
        }
        on_job_done(inner, &admitted);
    }
}

fn mark_failed(inner: &Inner, job_id: &str, reason: &str) {
    inner.metrics.pipeline_job_failed_total.inc();
    inner
        .metrics
        .jobs_finished_total
        .with_label_values(&[JobState::Failed.as_str()])
        .inc();
    let result = inner.store.update_job(job_id, |job| {
        job.state = JobState::Failed;
        job.error = Some(reason.to_string());
        job.message = "Failed".to_string();
    });
    if let Err(err) = result {
        tracing::warn!(job_id, error = %err, "failed to persist job failure");
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_for_both_string_kinds() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static panic");
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "static panic");

        let boxed: Box<dyn std::any::Any + Send> = Box::new("owned panic".to_string());
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "owned panic");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "unknown panic payload");
    }
}
