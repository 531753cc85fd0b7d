use std::path::Path;

use crate::dub_core::domain::{Job, Visibility};
use crate::dub_core::paths::job_id_from_path;
use crate::dub_core::store::{JobStore, StoreResult};

use super::Identity;

/// Read access: owner and admin always; anyone authenticated when shared.
pub fn can_view(identity: &Identity, owner_id: &str, visibility: Visibility) -> bool {
    identity.is_admin() || identity.user_id == owner_id || visibility == Visibility::Shared
}

/// Mutation is never granted through shared visibility.
pub fn can_mutate(identity: &Identity, owner_id: &str) -> bool {
    identity.is_admin() || identity.user_id == owner_id
}

pub fn can_view_job(identity: &Identity, job: &Job) -> bool {
    can_view(identity, &job.owner_id, job.visibility)
}

/// Resolve the job that owns an artifact path: first via an explicit
/// `job-<id>` segment, then by scanning jobs whose output tree contains the
/// path. Access to the file then follows the job's visibility.
pub fn job_for_artifact_path(store: &JobStore, path: &Path) -> StoreResult<Option<Job>> {
    if let Some(id) = job_id_from_path(path) {
        if let Some(job) = store.get_job(&id)? {
            return Ok(Some(job));
        }
    }

    for job in store.list_all_jobs()? {
        if job.work_dir.is_empty() {
            continue;
        }
        // The work dir lives directly under the job's output directory.
        let work_dir = Path::new(&job.work_dir);
        let output_dir = work_dir.parent().unwrap_or(work_dir);
        if path.starts_with(output_dir) {
            return Ok(Some(job));
        }
    }
    Ok(None)
}
