use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use chrono::Utc;

use crate::dub_core::audit::Audit;
use crate::dub_core::domain::{DevicePref, JobMode, QueuedJob, ResourceClass};
use crate::dub_core::metrics::Metrics;
use crate::dub_core::notify::Notifier;
use crate::dub_core::paths::Layout;
use crate::dub_core::quotas::QuotaService;
use crate::dub_core::redis_queue::RedisQueueAdapter;
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::JobStore;
use crate::system_metrics::sample_gpu_usage;

/// One queue slot. `not_before` delays re-attempts after a distributed-gate
/// refusal without losing queue position metadata.
#[derive(Debug, Clone)]
pub(crate) struct QueuedEntry {
    pub job: QueuedJob,
    pub not_before: Option<Instant>,
}

/// Mutable scheduler state, guarded by the engine mutex.
pub(crate) struct SchedState {
    pub queue: Vec<QueuedEntry>,
    pub running_global: usize,
    pub running_by_user: HashMap<String, usize>,
    pub running_by_class: HashMap<ResourceClass, usize>,
    /// Job ids currently being processed by a worker.
    pub running_jobs: HashSet<String>,
    /// Cooperative cancellation flags observed by the runner's child poll.
    pub cancel_requests: HashSet<String>,
    pub spawned_workers: usize,
}

impl SchedState {
    pub(crate) fn new() -> Self {
        Self {
            queue: Vec::new(),
            running_global: 0,
            running_by_user: HashMap::new(),
            running_by_class: HashMap::new(),
            running_jobs: HashSet::new(),
            cancel_requests: HashSet::new(),
            spawned_workers: 0,
        }
    }
}

/// Shared engine internals: scheduler state plus every service the workers
/// need. Built once by the composition root and shared via `Arc`.
pub(crate) struct Inner {
    pub state: Mutex<SchedState>,
    pub cv: Condvar,
    pub settings: Arc<AppSettings>,
    pub layout: Layout,
    pub store: Arc<JobStore>,
    pub quotas: Arc<QuotaService>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<Audit>,
    pub notifier: Arc<Notifier>,
    pub adapter: Option<Arc<RedisQueueAdapter>>,
    pub shutdown: AtomicBool,
}

/// Resolve the device a job will actually run on. `auto` prefers the GPU but
/// steps aside when it is saturated or absent.
pub(crate) fn resolve_device(settings: &AppSettings, device: DevicePref) -> DevicePref {
    match device {
        DevicePref::Cuda => DevicePref::Cuda,
        DevicePref::Cpu => DevicePref::Cpu,
        DevicePref::Auto => {
            let gpu = sample_gpu_usage();
            if gpu.available && !gpu.is_saturated(settings.gpu_util_max, settings.gpu_mem_max_ratio)
            {
                DevicePref::Cuda
            } else {
                DevicePref::Cpu
            }
        }
    }
}

/// The single resource class a job's admission is counted against.
pub(crate) fn resource_class(mode: JobMode, resolved_device: DevicePref) -> ResourceClass {
    if resolved_device == DevicePref::Cuda {
        return ResourceClass::Gpu;
    }
    match mode {
        // High and medium modes are dominated by the transcribe model;
        // low mode spends its time in synthesis.
        JobMode::High | JobMode::Medium => ResourceClass::Transcribe,
        JobMode::Low => ResourceClass::Tts,
    }
}

pub(crate) fn class_limit(settings: &AppSettings, class: ResourceClass) -> usize {
    match class {
        ResourceClass::Transcribe => settings.concurrency.max_transcribe,
        ResourceClass::Tts => settings.concurrency.max_tts,
        ResourceClass::Gpu => settings.concurrency.max_gpu,
    }
}

/// Effective priority: base plus the configured aging bonus, monotonic in
/// wait time and capped at the priority ceiling.
pub(crate) fn effective_priority(settings: &AppSettings, job: &QueuedJob) -> u32 {
    let bonus_per_minute = settings.concurrency.aging_bonus_per_minute;
    if bonus_per_minute == 0 {
        return job.priority;
    }
    let waited_minutes = (Utc::now() - job.created_at).num_minutes().max(0) as u32;
    job.priority
        .saturating_add(waited_minutes.saturating_mul(bonus_per_minute))
        .min(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_classes_split_by_mode() {
        assert_eq!(
            resource_class(JobMode::High, DevicePref::Cpu),
            ResourceClass::Transcribe
        );
        assert_eq!(
            resource_class(JobMode::Low, DevicePref::Cpu),
            ResourceClass::Tts
        );
        assert_eq!(
            resource_class(JobMode::Low, DevicePref::Cuda),
            ResourceClass::Gpu
        );
    }

    #[test]
    fn aging_bonus_is_monotonic_and_capped() {
        let mut settings = AppSettings::default();
        settings.concurrency.aging_bonus_per_minute = 100;
        let mut job = QueuedJob {
            job_id: "j1".to_string(),
            owner_id: "u1".to_string(),
            mode: JobMode::Medium,
            device: DevicePref::Cpu,
            priority: 900,
            created_at: Utc::now() - chrono::Duration::minutes(5),
        };
        assert_eq!(effective_priority(&settings, &job), 1000);

        job.priority = 50;
        job.created_at = Utc::now();
        assert_eq!(effective_priority(&settings, &job), 50);

        settings.concurrency.aging_bonus_per_minute = 0;
        job.created_at = Utc::now() - chrono::Duration::minutes(60);
        assert_eq!(effective_priority(&settings, &job), 50);
    }
}
