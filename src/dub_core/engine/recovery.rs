use crate::dub_core::domain::{JobState, QueuedJob};
use crate::dub_core::store::JobStore;

pub(crate) const RECOVERY_MESSAGE: &str = "Recovered after restart";

/// Startup recovery: every job left QUEUED or RUNNING by a previous process
/// goes back to QUEUED with a recovery message, and is re-submitted to the
/// scheduler. The runner consults the checkpoint to skip completed stages,
/// so recovered jobs resume rather than restart.
pub(crate) fn recover_interrupted_jobs(store: &JobStore) -> Vec<QueuedJob> {
    let jobs = match store.list_all_jobs() {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::warn!(error = %err, "recovery scan failed");
            return Vec::new();
        }
    };

    let mut recovered = Vec::new();
    for job in jobs {
        if !matches!(job.state, JobState::Queued | JobState::Running) {
            continue;
        }
        let was_running = job.state == JobState::Running;
        let result = store.update_job(&job.id, |row| {
            row.state = JobState::Queued;
            row.message = RECOVERY_MESSAGE.to_string();
        });
        match result {
            Ok(updated) => {
                if was_running {
                    tracing::info!(job_id = %updated.id, "recovered running job to QUEUED");
                }
                let priority = updated
                    .runtime
                    .get("priority")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(50) as u32;
                recovered.push(QueuedJob {
                    job_id: updated.id.clone(),
                    owner_id: updated.owner_id.clone(),
                    mode: updated.mode,
                    device: updated.device,
                    priority,
                    created_at: updated.created_at,
                });
            }
            Err(err) => tracing::warn!(job_id = %job.id, error = %err, "recovery update failed"),
        }
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dub_core::store::test_support;

    #[test]
    fn running_and_queued_jobs_recover_to_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(&dir.path().join("jobs.db")).unwrap();

        let mut running = test_support::job("j1", "u1");
        running.state = JobState::Running;
        running.progress = 0.3;
        store.put_job(&running).unwrap();

        store.put_job(&test_support::job("j2", "u1")).unwrap();

        let mut done = test_support::job("j3", "u1");
        done.state = JobState::Done;
        store.put_job(&done).unwrap();

        let mut paused = test_support::job("j4", "u1");
        paused.state = JobState::Paused;
        store.put_job(&paused).unwrap();

        let recovered = recover_interrupted_jobs(&store);
        let ids: Vec<&str> = recovered.iter().map(|job| job.job_id.as_str()).collect();
        assert!(ids.contains(&"j1"));
        assert!(ids.contains(&"j2"));
        assert_eq!(recovered.len(), 2);

        let j1 = store.get_job("j1").unwrap().unwrap();
        assert_eq!(j1.state, JobState::Queued);
        assert!(j1.message.contains(RECOVERY_MESSAGE));

        // Terminal and paused jobs are untouched.
        assert_eq!(store.get_job("j3").unwrap().unwrap().state, JobState::Done);
        assert_eq!(store.get_job("j4").unwrap().unwrap().state, JobState::Paused);
    }
}
