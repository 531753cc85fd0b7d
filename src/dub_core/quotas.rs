use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::dub_core::domain::JobState;
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::{AuthStore, JobStore, QuotaOverrides};
use crate::system_metrics::free_bytes_for_path;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("upload exceeds the per-user size limit")]
    UploadTooLarge,
    #[error("daily job quota exhausted")]
    JobsPerDayExceeded,
    #[error("too many concurrent jobs")]
    TooManyConcurrentJobs,
    #[error("storage quota exhausted")]
    StorageExceeded,
    #[error("insufficient free disk space")]
    DiskFull,
    #[error("quota lookup failed")]
    Internal,
}

/// Effective per-user limits after applying overrides. Zero means unlimited
/// for that knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveQuotas {
    pub max_upload_bytes: u64,
    pub jobs_per_day: u64,
    pub max_concurrent_jobs: u64,
    pub max_storage_bytes: u64,
}

/// Quota checks shared by upload init, job create, and scheduler admission.
pub struct QuotaService {
    settings: Arc<AppSettings>,
    auth_store: Arc<AuthStore>,
    job_store: Arc<JobStore>,
}

impl QuotaService {
    pub fn new(
        settings: Arc<AppSettings>,
        auth_store: Arc<AuthStore>,
        job_store: Arc<JobStore>,
    ) -> Self {
        Self {
            settings,
            auth_store,
            job_store,
        }
    }

    pub fn effective_for_user(&self, user_id: &str) -> Result<EffectiveQuotas, QuotaError> {
        let overrides: QuotaOverrides = self
            .auth_store
            .quota_overrides(user_id)
            .map_err(|_| QuotaError::Internal)?;
        let defaults = &self.settings.quotas;
        Ok(EffectiveQuotas {
            max_upload_bytes: overrides.max_upload_bytes.unwrap_or(defaults.max_upload_bytes),
            jobs_per_day: overrides.jobs_per_day.unwrap_or(defaults.jobs_per_day),
            max_concurrent_jobs: overrides
                .max_concurrent_jobs
                .unwrap_or(defaults.max_concurrent_jobs),
            max_storage_bytes: overrides
                .max_storage_bytes
                .unwrap_or(defaults.max_storage_bytes),
        })
    }

    /// Require free space on the output filesystem before allocating work.
    pub fn check_disk_guard(&self) -> Result<(), QuotaError> {
        let min_free = self.settings.min_free_gb.saturating_mul(1024 * 1024 * 1024);
        if min_free == 0 {
            return Ok(());
        }
        match free_bytes_for_path(&self.settings.output_dir) {
            Some(free) if free < min_free => Err(QuotaError::DiskFull),
            // Unknown filesystems (e.g. fresh tmpfs in tests) are not a
            // reason to refuse work.
            _ => Ok(()),
        }
    }

    /// Upload-init gate: size limit plus storage headroom.
    pub fn check_upload(&self, user_id: &str, total_bytes: u64) -> Result<(), QuotaError> {
        let quotas = self.effective_for_user(user_id)?;
        if quotas.max_upload_bytes > 0 && total_bytes > quotas.max_upload_bytes {
            return Err(QuotaError::UploadTooLarge);
        }
        if quotas.max_storage_bytes > 0 {
            let used = self
                .job_store
                .storage_bytes_for_user(user_id)
                .map_err(|_| QuotaError::Internal)?;
            if used.saturating_add(total_bytes) > quotas.max_storage_bytes {
                return Err(QuotaError::StorageExceeded);
            }
        }
        self.check_disk_guard()
    }

    /// Job-create gate: daily cap and storage.
    pub fn check_job_create(&self, user_id: &str) -> Result<(), QuotaError> {
        let quotas = self.effective_for_user(user_id)?;
        if quotas.jobs_per_day > 0 {
            let since = Utc::now() - Duration::days(1);
            let today = self
                .job_store
                .count_jobs_created_since(user_id, since)
                .map_err(|_| QuotaError::Internal)?;
            if today >= quotas.jobs_per_day {
                return Err(QuotaError::JobsPerDayExceeded);
            }
        }
        if quotas.max_storage_bytes > 0 {
            let used = self
                .job_store
                .storage_bytes_for_user(user_id)
                .map_err(|_| QuotaError::Internal)?;
            if used > quotas.max_storage_bytes {
                return Err(QuotaError::StorageExceeded);
            }
        }
        self.check_disk_guard()
    }

    /// Admission gate: per-user ceiling on RUNNING jobs, checked right
    /// before dispatch.
    pub fn check_admission(&self, user_id: &str) -> Result<(), QuotaError> {
        let quotas = self.effective_for_user(user_id)?;
        if quotas.max_concurrent_jobs > 0 {
            let active = self
                .job_store
                .count_jobs_for_user_in_states(user_id, &[JobState::Running])
                .map_err(|_| QuotaError::Internal)?;
            if active >= quotas.max_concurrent_jobs {
                return Err(QuotaError::TooManyConcurrentJobs);
            }
        }
        self.check_disk_guard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dub_core::store::test_support;

    fn service(dir: &std::path::Path) -> QuotaService {
        let mut settings = AppSettings::default();
        settings.output_dir = dir.join("Output");
        settings.min_free_gb = 0;
        settings.quotas.max_upload_bytes = 100;
        settings.quotas.jobs_per_day = 2;
        settings.quotas.max_storage_bytes = 1000;
        let auth = Arc::new(AuthStore::open(&dir.join("auth.db")).unwrap());
        let jobs = Arc::new(JobStore::open(&dir.join("jobs.db")).unwrap());
        QuotaService::new(Arc::new(settings), auth, jobs)
    }

    #[test]
    fn upload_gate_enforces_size_and_storage() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(service.check_upload("u1", 50).is_ok());
        assert_eq!(
            service.check_upload("u1", 101).unwrap_err(),
            QuotaError::UploadTooLarge
        );

        service
            .job_store
            .replace_storage_accounting(&[crate::dub_core::store::StorageEntry {
                object_id: "job:j1".to_string(),
                user_id: "u1".to_string(),
                bytes: 980,
            }])
            .unwrap();
        assert_eq!(
            service.check_upload("u1", 50).unwrap_err(),
            QuotaError::StorageExceeded
        );
    }

    #[test]
    fn daily_job_cap_counts_recent_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.job_store.put_job(&test_support::job("j1", "u1")).unwrap();
        assert!(service.check_job_create("u1").is_ok());
        service.job_store.put_job(&test_support::job("j2", "u1")).unwrap();
        assert_eq!(
            service.check_job_create("u1").unwrap_err(),
            QuotaError::JobsPerDayExceeded
        );
        // Other users are unaffected.
        assert!(service.check_job_create("u2").is_ok());
    }

    #[test]
    fn overrides_replace_global_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service
            .auth_store
            .set_quota_overrides(
                "u1",
                &QuotaOverrides {
                    max_upload_bytes: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        let quotas = service.effective_for_user("u1").unwrap();
        assert_eq!(quotas.max_upload_bytes, 10);
        assert_eq!(quotas.jobs_per_day, 2);
        assert_eq!(
            service.check_upload("u1", 11).unwrap_err(),
            QuotaError::UploadTooLarge
        );
    }

    #[test]
    fn concurrency_gate_counts_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let mut running = test_support::job("j1", "u1");
        running.state = JobState::Running;
        service.job_store.put_job(&running).unwrap();
        let mut running2 = test_support::job("j2", "u1");
        running2.state = JobState::Running;
        service.job_store.put_job(&running2).unwrap();

        assert_eq!(
            service.check_admission("u1").unwrap_err(),
            QuotaError::TooManyConcurrentJobs
        );
        assert!(service.check_admission("u2").is_ok());
    }
}
