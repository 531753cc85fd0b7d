//! Two-tier admission scheduler and stage pipeline runner, split into
//! `state`, `scheduler`, `worker`, `runner`, and `recovery`.

mod recovery;
mod runner;
mod scheduler;
mod state;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::dub_core::audit::Audit;
use crate::dub_core::domain::{clamp_priority, Job, JobState, QueuedJob};
use crate::dub_core::metrics::Metrics;
use crate::dub_core::notify::Notifier;
use crate::dub_core::paths::Layout;
use crate::dub_core::quotas::QuotaService;
use crate::dub_core::redis_queue::{AdapterStatus, QueueBackendMode, RedisQueueAdapter};
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::JobStore;
use crate::sync_ext::MutexExt;

pub use scheduler::{QueueSnapshotEntry, SchedulerState};
use state::{Inner, SchedState};

pub const DEFAULT_JOB_PRIORITY: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("job not found")]
    NotFound,
    #[error("invalid state transition: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Store(String),
}

/// Everything the engine composes over; built once in the composition root.
pub struct EngineDeps {
    pub settings: Arc<AppSettings>,
    pub layout: Layout,
    pub store: Arc<JobStore>,
    pub quotas: Arc<QuotaService>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<Audit>,
    pub notifier: Arc<Notifier>,
    pub adapter: Option<Arc<RedisQueueAdapter>>,
}

/// The orchestration engine facade: admission scheduling, worker dispatch,
/// cancellation, and queue introspection.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build the engine, recover interrupted jobs, and spawn the worker pool.
    pub fn start(deps: EngineDeps) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedState::new()),
            cv: Condvar::new(),
            settings: deps.settings,
            layout: deps.layout,
            store: deps.store,
            quotas: deps.quotas,
            metrics: deps.metrics,
            audit: deps.audit,
            notifier: deps.notifier,
            adapter: deps.adapter,
            shutdown: AtomicBool::new(false),
        });

        for job in recovery::recover_interrupted_jobs(&inner.store) {
            scheduler::submit(&inner, job);
        }

        worker::spawn_workers(&inner);
        spawn_adapter_maintenance(&inner);

        Self { inner }
    }

    /// Test construction without worker threads; admission selection is then
    /// driven manually via `tick_for_tests`.
    #[cfg(test)]
    pub(crate) fn start_without_workers(deps: EngineDeps) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedState::new()),
            cv: Condvar::new(),
            settings: deps.settings,
            layout: deps.layout,
            store: deps.store,
            quotas: deps.quotas,
            metrics: deps.metrics,
            audit: deps.audit,
            notifier: deps.notifier,
            adapter: deps.adapter,
            shutdown: AtomicBool::new(false),
        });
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn tick_for_tests(&self) -> Option<String> {
        let mut state = self.inner.state.lock_unpoisoned();
        scheduler::select_admissible_locked(&self.inner, &mut state)
            .map(|admitted| admitted.job.job_id)
    }

    #[cfg(test)]
    pub(crate) fn complete_for_tests(&self, job_id: &str, owner_id: &str) {
        use crate::dub_core::domain::{DevicePref, JobMode, ResourceClass};
        let admitted = scheduler::AdmittedJob {
            job: QueuedJob {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
                mode: JobMode::Medium,
                device: DevicePref::Cpu,
                priority: DEFAULT_JOB_PRIORITY,
                created_at: chrono::Utc::now(),
            },
            class: ResourceClass::Transcribe,
            resolved_device: DevicePref::Cpu,
        };
        scheduler::on_job_done(&self.inner, &admitted);
    }

    /// Submit a stored job to the scheduler (and, when active, the
    /// distributed queue).
    pub fn submit_job(&self, job: &Job, priority: u32) {
        let priority = clamp_priority(priority);
        let queued = QueuedJob {
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            mode: job.mode,
            device: job.device,
            priority,
            created_at: job.created_at,
        };
        if let Some(adapter) = &self.inner.adapter {
            adapter.submit_job(
                &job.id,
                &job.owner_id,
                priority,
                &serde_json::json!({ "mode": job.mode.as_str(), "device": job.device.as_str() }),
            );
        }
        scheduler::submit(&self.inner, queued);
    }

    /// Idempotent cancel: flags a running job for the runner's next poll,
    /// removes a queued one outright, and marks the store CANCELED.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        scheduler::request_cancel(&self.inner, job_id)
    }

    /// QUEUED -> PAUSED. Anything else is a transition conflict.
    pub fn pause_job(&self, job_id: &str) -> Result<(), EngineError> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .map_err(|err| EngineError::Store(err.to_string()))?
            .ok_or(EngineError::NotFound)?;
        if job.state != JobState::Queued {
            return Err(EngineError::Conflict(format!(
                "cannot pause a {} job",
                job.state.as_str()
            )));
        }
        scheduler::drop_job(&self.inner, job_id);
        self.inner
            .store
            .update_job(job_id, |row| {
                row.state = JobState::Paused;
                row.message = "Paused".to_string();
            })
            .map_err(|err| EngineError::Store(err.to_string()))?;
        Ok(())
    }

    /// PAUSED -> QUEUED. Anything else is a transition conflict.
    pub fn resume_job(&self, job_id: &str) -> Result<(), EngineError> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .map_err(|err| EngineError::Store(err.to_string()))?
            .ok_or(EngineError::NotFound)?;
        if job.state != JobState::Paused {
            return Err(EngineError::Conflict(format!(
                "cannot resume a {} job",
                job.state.as_str()
            )));
        }
        let updated = self
            .inner
            .store
            .update_job(job_id, |row| {
                row.state = JobState::Queued;
                row.message = "Queued".to_string();
            })
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let priority = updated
            .runtime
            .get("priority")
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::from(DEFAULT_JOB_PRIORITY)) as u32;
        self.submit_job(&updated, priority);
        Ok(())
    }

    /// Returns false when the job is not currently queued.
    pub fn reprioritize(&self, job_id: &str, priority: u32) -> bool {
        let changed = scheduler::reprioritize(&self.inner, job_id, priority);
        if changed {
            let _ = self.inner.store.update_job(job_id, |row| {
                row.runtime
                    .insert("priority".to_string(), serde_json::json!(priority));
            });
        }
        changed
    }

    /// Remove a job from the queue; returns how many entries were dropped.
    pub fn drop_job(&self, job_id: &str) -> usize {
        scheduler::drop_job(&self.inner, job_id)
    }

    pub fn snapshot_queue(&self, limit: usize) -> Vec<QueueSnapshotEntry> {
        scheduler::snapshot_queue(&self.inner, limit)
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        scheduler::scheduler_state(&self.inner)
    }

    /// Distributed backend status; `local` deployments report fallback-free
    /// local mode as `None`.
    pub fn queue_backend_status(&self) -> Option<AdapterStatus> {
        self.inner.adapter.as_ref().map(|adapter| adapter.status())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
    }
}

/// Adapter upkeep: periodic probe flips local/redis mode, and every running
/// job's lock is refreshed at the configured heartbeat interval.
fn spawn_adapter_maintenance(inner: &Arc<Inner>) {
    let Some(adapter) = inner.adapter.clone() else {
        return;
    };
    let inner_clone = inner.clone();
    let result = std::thread::Builder::new()
        .name("dubforge-queue-heartbeat".to_string())
        .spawn(move || {
            let interval = adapter.lock_refresh_interval();
            loop {
                if inner_clone.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if adapter.is_active() {
                    let running: Vec<String> = {
                        let state = inner_clone.state.lock_unpoisoned();
                        state.running_jobs.iter().cloned().collect()
                    };
                    for job_id in running {
                        adapter.heartbeat(&job_id);
                    }
                } else {
                    adapter.probe();
                }
                std::thread::sleep(interval.min(Duration::from_secs(30)));
            }
        });
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to spawn queue heartbeat thread");
    }
}

/// Convenience: expose whether the distributed adapter currently routes
/// admissions (for the admin/status surface).
pub fn backend_mode_name(status: &Option<AdapterStatus>) -> &'static str {
    match status {
        None => "local",
        Some(status) => match status.mode {
            QueueBackendMode::Redis => "redis",
            QueueBackendMode::Fallback => "fallback",
        },
    }
}
